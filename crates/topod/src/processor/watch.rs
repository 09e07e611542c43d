use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use super::{is_stopped, report, wait_or_stop, Processor, WATCH_RETRY_DELAY};
use crate::config::Config;
use crate::error::{ConfigError, ProcessError};
use crate::resource::{self, TemplateResource};
use crate::store::{StoreClient, StoreError};

/// Keeps every resource in sync by long-polling its prefix, one thread per
/// resource.
pub struct Watcher {
    resources: Vec<TemplateResource>,
    store: Arc<dyn StoreClient>,
    stop: Receiver<()>,
    done: Sender<()>,
    errors: Sender<ProcessError>,
    retry_delay: Duration,
}

impl Watcher {
    /// Discovers the resources under `config`. Any bad declaration fails here.
    pub fn new(
        config: &Config,
        stop: Receiver<()>,
        done: Sender<()>,
        errors: Sender<ProcessError>,
    ) -> Result<Self, ConfigError> {
        let store = config.store_client()?;
        let resources = resource::discover(config)?;
        Ok(Self {
            resources,
            store,
            stop,
            done,
            errors,
            retry_delay: WATCH_RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn resources(&self) -> &[TemplateResource] {
        &self.resources
    }
}

impl Processor for Watcher {
    fn process(self: Box<Self>) {
        let Watcher {
            resources,
            store,
            stop,
            done,
            errors,
            retry_delay,
        } = *self;
        info!("Watching {} template resources", resources.len());

        thread::scope(|s| {
            let handles: Vec<_> = resources
                .iter()
                .map(|resource| {
                    let store = &*store;
                    let stop = &stop;
                    let errors = &errors;
                    let handle = s.spawn(move || {
                        monitor(resource, store, stop, errors, retry_delay)
                    });
                    (resource.dest(), handle)
                })
                .collect();

            for (dest, handle) in handles {
                if handle.join().is_err() {
                    error!("Watch thread for {} panicked", dest.display());
                } else {
                    debug!("Watch thread for {} finished", dest.display());
                }
            }
        });

        info!("All watch threads have stopped");
        drop(done);
    }
}

fn monitor(
    resource: &TemplateResource,
    store: &dyn StoreClient,
    stop: &Receiver<()>,
    errors: &Sender<ProcessError>,
    retry_delay: Duration,
) {
    let prefix = resource.prefix();
    while !is_stopped(stop) {
        let last = resource.last_index();
        debug!("Watching prefix {} from index {}", prefix, last);

        match store.watch_prefix(prefix, last, stop) {
            Ok(index) => {
                if !resource.advance_index(index) {
                    // Only a misbehaving store answers without a newer index.
                    warn!(
                        "Store returned index {} for {} after {}, retrying",
                        index, prefix, last
                    );
                    if wait_or_stop(stop, retry_delay) {
                        break;
                    }
                    continue;
                }
                if is_stopped(stop) {
                    break;
                }
                debug!("Prefix {} changed at index {}, processing", prefix, index);
                match resource.process() {
                    Ok(outcome) => debug!("{}: {}", resource.dest().display(), outcome),
                    Err(e) => report(errors, e),
                }
            }
            Err(StoreError::Stopped) => break,
            Err(e) if e.is_watch_timeout() => {
                debug!("Watch on {} expired, re-establishing", prefix);
            }
            Err(source) => {
                report(
                    errors,
                    ProcessError::StoreWatch {
                        prefix: prefix.to_string(),
                        source,
                    },
                );
                if wait_or_stop(stop, retry_delay) {
                    break;
                }
            }
        }
    }
    debug!("Stopped watching prefix {}", prefix);
}
