use crate::config::RegistrationConfig;
use crate::logging;
use std::sync::Mutex;

/// Collaborator notified whenever slot occupancy or the usable slot count
/// changes. The EchoLink directory announcement protocol lives behind this
/// trait and is not part of the core.
pub trait Registry: Send + Sync {
    fn start(&self) {}

    fn stop(&self) {}

    /// Observe `used` busy slots out of `total` usable ones.
    fn update(&self, used: usize, total: usize);
}

/// Registry reporting occupancy transitions to the log.
pub struct LogRegistry {
    config: RegistrationConfig,
    last: Mutex<Option<(usize, usize)>>,
    log: logging::Logger,
}

impl LogRegistry {
    pub fn new(config: &RegistrationConfig, log: &logging::Logger) -> LogRegistry {
        LogRegistry {
            config: config.clone(),
            last: Mutex::new(None),
            log: log.new(logging::o!("component" => "registration")),
        }
    }
}

impl Registry for LogRegistry {
    fn start(&self) {
        if self.config.enabled {
            logging::info!(self.log, "registration started";
                           "name" => self.config.name.as_deref().unwrap_or(""),
                           "comment" => self.config.comment.as_deref().unwrap_or(""));
        }
    }

    fn stop(&self) {
        if self.config.enabled {
            logging::info!(self.log, "registration stopped");
        }
    }

    fn update(&self, used: usize, total: usize) {
        let mut last = self.last.lock().expect("Registry lock poisoned");

        if *last == Some((used, total)) {
            return;
        }
        *last = Some((used, total));

        if self.config.enabled {
            logging::info!(self.log, "occupancy changed"; "used" => used, "total" => total);
        } else {
            logging::debug!(self.log, "occupancy changed"; "used" => used, "total" => total);
        }
    }
}

/// Registry that ignores every notification, for tests.
pub struct NullRegistry;

impl Registry for NullRegistry {
    fn update(&self, _used: usize, _total: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_registry_dedups_updates() {
        let registry = LogRegistry::new(&RegistrationConfig::default(), &logging::test());

        registry.update(1, 2);
        registry.update(1, 2);
        registry.update(0, 2);

        assert_eq!(*registry.last.lock().unwrap(), Some((0, 2)));
    }
}
