use std::path::Path;

use shield::ShieldConfig;

use crate::error::Result;
use crate::scenario::{Scenario, SimulationReport};

pub async fn execute(path: &Path, config: &ShieldConfig) -> Result<SimulationReport> {
	let scenario = Scenario::from_file(path)?;
	Ok(scenario.run(config).await)
}
