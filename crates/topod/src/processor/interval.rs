use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};

use super::{is_stopped, report, wait_or_stop, Processor};
use crate::config::Config;
use crate::error::{ConfigError, ProcessError};
use crate::resource::{self, TemplateResource};

/// Processes every resource on a fixed period.
pub struct IntervalProcessor {
    config: Config,
    resources: Vec<TemplateResource>,
    interval: Duration,
    stop: Receiver<()>,
    done: Sender<()>,
    errors: Sender<ProcessError>,
}

impl IntervalProcessor {
    pub fn new(
        config: &Config,
        interval: Duration,
        stop: Receiver<()>,
        done: Sender<()>,
        errors: Sender<ProcessError>,
    ) -> Result<Self, ConfigError> {
        let resources = resource::discover(config)?;
        Ok(Self {
            config: config.clone(),
            resources,
            interval,
            stop,
            done,
            errors,
        })
    }

    fn round(&self) {
        for resource in &self.resources {
            if is_stopped(&self.stop) {
                return;
            }
            match resource.process() {
                Ok(outcome) => debug!("{}: {}", resource.dest().display(), outcome),
                Err(e) => report(&self.errors, e),
            }
        }
    }
}

impl Processor for IntervalProcessor {
    fn process(mut self: Box<Self>) {
        info!(
            "Processing {} template resources every {:?}",
            self.resources.len(),
            self.interval
        );
        loop {
            self.round();
            if wait_or_stop(&self.stop, self.interval) {
                break;
            }
            // pick up declarations added since the last round
            match resource::discover(&self.config) {
                Ok(resources) => self.resources = resources,
                Err(e) => error!("Keeping previous template resources: {}", e),
            }
        }
        info!("Interval processing stopped");
        drop(self.done);
    }
}
