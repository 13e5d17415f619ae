/// Capture resource lifecycle policy
///
/// Owns acquire/release of the bound audio source. The session decides *when*
/// a detection cycle ends; this controller decides what that means for the
/// device: released under `AutoRelease`, kept open under `AlwaysOn`.

use crate::error::HotwordError;
use crate::model::millis;
use crate::source::AudioSource;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happens to the capture resource at the end of a detection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceControlMode {
    /// Release after every stop or detection
    #[default]
    AutoRelease,
    /// Hold the device until the session is released
    AlwaysOn,
}

impl std::str::FromStr for ResourceControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto_release" => Ok(Self::AutoRelease),
            "always_on" => Ok(Self::AlwaysOn),
            other => Err(format!("unknown resource control mode: {}", other)),
        }
    }
}

/// Bounded retry budget for opening the capture device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquirePolicy {
    /// Total open attempts before giving up
    pub attempts: u32,

    /// Pause between attempts
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            interval: Duration::from_millis(500),
        }
    }
}

/// Resource holding state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Released,
    Acquiring,
    Held,
}

struct Inner {
    state: ResourceState,
    mode: ResourceControlMode,
    source: AudioSource,
}

pub struct ResourceController {
    inner: Mutex<Inner>,
    policy: AcquirePolicy,
}

impl ResourceController {
    pub fn new(source: AudioSource, mode: ResourceControlMode, policy: AcquirePolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ResourceState::Released,
                mode,
                source,
            }),
            policy,
        }
    }

    /// Open the device, retrying within the policy budget
    ///
    /// No-op if already held. The state lock is not held while sleeping
    /// between attempts, so observers see `Acquiring`.
    pub fn acquire(&self) -> Result<(), HotwordError> {
        let source = {
            let mut inner = self.inner.lock();
            match inner.state {
                ResourceState::Held => return Ok(()),
                ResourceState::Acquiring => {
                    return Err(HotwordError::InvalidResourceState(
                        "acquisition already in progress".to_string(),
                    ))
                }
                ResourceState::Released => {}
            }
            inner.state = ResourceState::Acquiring;
            inner.source.clone()
        };

        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match source.open() {
                Ok(()) => {
                    self.inner.lock().state = ResourceState::Held;
                    info!(
                        "Acquired audio source #{} (attempt {}/{})",
                        source.id(),
                        attempt,
                        attempts
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Audio source #{} not ready (attempt {}/{}): {}",
                        source.id(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                std::thread::sleep(self.policy.interval);
            }
        }

        self.inner.lock().state = ResourceState::Released;
        Err(HotwordError::DeviceAcquisitionFailure {
            attempts,
            reason: last_error,
        })
    }

    /// Close the device if held. Never fails.
    ///
    /// A device that is already torn down counts as released.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ResourceState::Released {
            return;
        }

        if let Err(e) = inner.source.close() {
            debug!(
                "Audio source #{} already torn down: {}",
                inner.source.id(),
                e
            );
        }
        inner.state = ResourceState::Released;
        info!("Released audio source #{}", inner.source.id());
    }

    /// Apply the mode policy at the end of a detection cycle
    ///
    /// Returns true if the resource was released.
    pub fn complete_cycle(&self) -> bool {
        if self.mode() == ResourceControlMode::AutoRelease {
            self.release();
            true
        } else {
            false
        }
    }

    pub fn set_mode(&self, mode: ResourceControlMode) -> Result<(), HotwordError> {
        let mut inner = self.inner.lock();
        if inner.state == ResourceState::Acquiring {
            return Err(HotwordError::InvalidResourceState(
                "cannot change resource control mode during acquisition".to_string(),
            ));
        }
        if inner.mode != mode {
            info!("Resource control mode: {:?} -> {:?}", inner.mode, mode);
            inner.mode = mode;
        }
        Ok(())
    }

    /// Swap the controlled source; the old one is released first
    pub fn replace_source(&self, source: AudioSource) -> Result<AudioSource, HotwordError> {
        let mut inner = self.inner.lock();
        if inner.state == ResourceState::Acquiring {
            return Err(HotwordError::InvalidResourceState(
                "cannot replace audio source during acquisition".to_string(),
            ));
        }
        if inner.state == ResourceState::Held {
            if let Err(e) = inner.source.close() {
                debug!("Previous audio source already torn down: {}", e);
            }
            inner.state = ResourceState::Released;
        }
        Ok(std::mem::replace(&mut inner.source, source))
    }

    pub fn mode(&self) -> ResourceControlMode {
        self.inner.lock().mode
    }

    pub fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    pub fn is_held(&self) -> bool {
        self.state() == ResourceState::Held
    }

    pub fn source(&self) -> AudioSource {
        self.inner.lock().source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DeviceError, MockCaptureDevice, ReplayDevice};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> AcquirePolicy {
        AcquirePolicy {
            attempts,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "auto-release".parse::<ResourceControlMode>().unwrap(),
            ResourceControlMode::AutoRelease
        );
        assert_eq!(
            "ALWAYS_ON".parse::<ResourceControlMode>().unwrap(),
            ResourceControlMode::AlwaysOn
        );
        assert!("sometimes".parse::<ResourceControlMode>().is_err());
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let mut device = MockCaptureDevice::new();
        device.expect_open().times(1).returning(|| Ok(()));

        let controller = ResourceController::new(
            AudioSource::new(device),
            ResourceControlMode::AlwaysOn,
            fast_policy(4),
        );

        controller.acquire().unwrap();
        controller.acquire().unwrap();
        assert!(controller.is_held());
    }

    #[test]
    fn test_acquire_retries_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut device = MockCaptureDevice::new();
        device.expect_open().times(3).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DeviceError::NotReady("warming up".to_string()))
            } else {
                Ok(())
            }
        });

        let controller = ResourceController::new(
            AudioSource::new(device),
            ResourceControlMode::AutoRelease,
            fast_policy(4),
        );

        controller.acquire().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_acquire_gives_up_after_budget() {
        let mut device = MockCaptureDevice::new();
        device
            .expect_open()
            .times(4)
            .returning(|| Err(DeviceError::NotReady("busy".to_string())));

        let controller = ResourceController::new(
            AudioSource::new(device),
            ResourceControlMode::AutoRelease,
            fast_policy(4),
        );

        match controller.acquire() {
            Err(HotwordError::DeviceAcquisitionFailure { attempts, reason }) => {
                assert_eq!(attempts, 4);
                assert!(reason.contains("busy"));
            }
            other => panic!("expected acquisition failure, got {:?}", other),
        }
        assert_eq!(controller.state(), ResourceState::Released);
    }

    #[test]
    fn test_release_tolerates_torn_down_device() {
        let mut device = MockCaptureDevice::new();
        device.expect_open().returning(|| Ok(()));
        device
            .expect_close()
            .times(1)
            .returning(|| Err(DeviceError::Closed));

        let controller = ResourceController::new(
            AudioSource::new(device),
            ResourceControlMode::AutoRelease,
            fast_policy(1),
        );

        controller.acquire().unwrap();
        controller.release();
        controller.release();
        assert_eq!(controller.state(), ResourceState::Released);
    }

    #[test]
    fn test_complete_cycle_follows_mode() {
        let source = AudioSource::new(ReplayDevice::new(vec![]));
        let controller =
            ResourceController::new(source.clone(), ResourceControlMode::AlwaysOn, fast_policy(1));

        controller.acquire().unwrap();
        assert!(!controller.complete_cycle());
        assert!(source.is_open());

        controller.set_mode(ResourceControlMode::AutoRelease).unwrap();
        assert!(controller.complete_cycle());
        assert!(!source.is_open());
    }

    #[test]
    fn test_mode_switch_rejected_mid_acquisition() {
        let mut device = MockCaptureDevice::new();
        device
            .expect_open()
            .returning(|| Err(DeviceError::NotReady("slow".to_string())));

        let controller = Arc::new(ResourceController::new(
            AudioSource::new(device),
            ResourceControlMode::AutoRelease,
            AcquirePolicy {
                attempts: 3,
                interval: Duration::from_millis(100),
            },
        ));

        let acquiring = {
            let controller = Arc::clone(&controller);
            std::thread::spawn(move || controller.acquire())
        };

        while controller.state() != ResourceState::Acquiring {
            std::thread::yield_now();
        }
        assert!(matches!(
            controller.set_mode(ResourceControlMode::AlwaysOn),
            Err(HotwordError::InvalidResourceState(_))
        ));

        assert!(acquiring.join().unwrap().is_err());
        assert!(controller.set_mode(ResourceControlMode::AlwaysOn).is_ok());
    }

    #[test]
    fn test_replace_source_releases_old() {
        let old = AudioSource::new(ReplayDevice::new(vec![]));
        let new = AudioSource::new(ReplayDevice::new(vec![]));
        let controller =
            ResourceController::new(old.clone(), ResourceControlMode::AlwaysOn, fast_policy(1));

        controller.acquire().unwrap();
        let previous = controller.replace_source(new.clone()).unwrap();

        assert!(previous.same_as(&old));
        assert!(!old.is_open());
        assert!(!controller.is_held());
        assert!(controller.source().same_as(&new));
    }
}
