use async_trait::async_trait;
use gwtypes::GwResult;

/// Named breakpoints in the reshard protocol a test harness can force
/// to fail (§4.5 "Fault-injection hook"). Production code always gets
/// `Ok(())`. Named points: `set_target_layout`, `revert_target_layout`,
/// `block_writes`, `do_reshard`, `commit_target_layout`.
#[async_trait]
pub trait FaultInjector: Send + Sync + 'static {
    async fn check(&self, name: &str) -> GwResult<()>;
}

/// The production implementation: never trips.
pub struct NoFaults;

#[async_trait]
impl FaultInjector for NoFaults {
    async fn check(&self, _name: &str) -> GwResult<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use gwtypes::GwError;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    /// Trips on any breakpoint named in its `trip_on` set.
    pub struct BreakpointFaults {
        trip_on: Mutex<HashSet<String>>,
    }

    impl BreakpointFaults {
        pub fn new(trip_on: impl IntoIterator<Item = &'static str>) -> Self {
            Self {
                trip_on: Mutex::new(trip_on.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl FaultInjector for BreakpointFaults {
        async fn check(&self, name: &str) -> GwResult<()> {
            if self.trip_on.lock().await.contains(name) {
                Err(GwError::Canceled(format!("fault injected at {name}")))
            } else {
                Ok(())
            }
        }
    }
}
