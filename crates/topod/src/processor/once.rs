use log::{error, info};

use crate::config::Config;
use crate::error::{ProcessError, Result};
use crate::resource;

/// Processes every resource once. A failing resource does not stop the
/// others; the last failure is returned.
pub fn process_once(config: &Config) -> Result<()> {
    let resources = resource::discover(config)?;

    let mut last_error: Option<ProcessError> = None;
    for resource in &resources {
        match resource.process() {
            Ok(outcome) => info!("{}: {}", resource.dest().display(), outcome),
            Err(e) => {
                error!("Processing {} failed: {}", resource.src().display(), e);
                last_error = Some(e);
            }
        }
    }
    info!("Processed all template resources");

    match last_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
