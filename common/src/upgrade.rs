//! Firmware upgrade sub-task: remembers the announced image, gates upgrade
//! requests on the failure history and reports the outcome to the cloud.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};

use crate::frame::FrameBuilderUser;
use crate::payload::FirmwareUpgradeControl;
use crate::protocol::firmware::{FirmwareFailureReason, FirmwareUpdateStatus, FirmwareVersion};
use crate::queue::Queue;
use crate::settings::Settings;
use crate::types::{ConnectionStatusChangeRequest, FirmwareUpgradeState};

/// Consecutive failures after which upgrade requests are refused.
pub const MAX_UPGRADE_FAILURES: u8 = 3;

/// Fetches an image and writes it to the inactive slot.
pub trait FirmwareDownloader: Send + Sync {
    /// Bytes written on success.
    fn download_and_apply(&self, url: &str) -> Result<u64, FirmwareFailureReason>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingImage {
    url: String,
    version: FirmwareVersion,
}

pub struct FirmwareUpgradeController {
    settings: Arc<dyn Settings>,
    status_requests: Arc<Queue<ConnectionStatusChangeRequest>>,
    outbox: Arc<Queue<FrameBuilderUser>>,
    pending: Mutex<Option<PendingImage>>,
    state: Mutex<FirmwareUpgradeState>,
    running: AtomicBool,
}

impl FirmwareUpgradeController {
    pub fn new(
        settings: Arc<dyn Settings>,
        status_requests: Arc<Queue<ConnectionStatusChangeRequest>>,
        outbox: Arc<Queue<FrameBuilderUser>>,
    ) -> Self {
        Self {
            settings,
            status_requests,
            outbox,
            pending: Mutex::new(None),
            state: Mutex::new(FirmwareUpgradeState::NotRequested),
            running: AtomicBool::new(false),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingImage>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> FirmwareUpgradeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FirmwareUpgradeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_blocked(&self) -> bool {
        self.settings.fw_upgrade_failures() >= MAX_UPGRADE_FAILURES
    }

    /// Runs one upgrade to completion on the calling thread. Returns false
    /// without doing anything when no image is pending or one is running.
    pub fn run_upgrade(&self, downloader: &dyn FirmwareDownloader) -> bool {
        let Some(image) = self.pending().clone() else {
            warn!("firmware upgrade started without an image url");
            self.finish(Err(FirmwareFailureReason::DownloadFailed));
            return false;
        };
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("firmware upgrade already running");
            return false;
        }

        info!("upgrading firmware to {} from {}", image.version, image.url);
        self.set_state(FirmwareUpgradeState::Started);
        self.set_state(FirmwareUpgradeState::InProgress);
        let outcome = downloader.download_and_apply(&image.url);
        self.finish(outcome);
        self.running.store(false, Ordering::Release);
        true
    }

    fn finish(&self, outcome: Result<u64, FirmwareFailureReason>) {
        let report = match outcome {
            Ok(written) => {
                info!("firmware image written ({written} bytes)");
                self.settings.set_fw_upgrade_failures(0);
                self.set_state(FirmwareUpgradeState::Completed);
                FirmwareUpdateStatus {
                    state: FirmwareUpgradeState::Completed,
                    failure_reason: FirmwareFailureReason::None,
                    retry_count: 0,
                }
            }
            Err(reason) => {
                let failures = self.settings.fw_upgrade_failures().saturating_add(1);
                error!("firmware upgrade failed: {reason:?} (failure {failures})");
                self.settings.set_fw_upgrade_failures(failures);
                self.set_state(FirmwareUpgradeState::Failed);
                FirmwareUpdateStatus {
                    state: FirmwareUpgradeState::Failed,
                    failure_reason: reason,
                    retry_count: failures,
                }
            }
        };
        if !self.outbox.push(report.build()) {
            warn!("outbox full, firmware status report dropped");
        }
    }

    /// Spawns [`Self::run_upgrade`] on its own thread.
    pub fn spawn(self: &Arc<Self>, downloader: Arc<dyn FirmwareDownloader>) -> std::io::Result<()> {
        let controller = Arc::clone(self);
        std::thread::Builder::new()
            .name("fw-upgrade".to_string())
            .stack_size(16 * 1024)
            .spawn(move || {
                controller.run_upgrade(downloader.as_ref());
            })
            .map(|_| ())
    }
}

impl FirmwareUpgradeControl for FirmwareUpgradeController {
    fn set_url(&self, url: &str, version: FirmwareVersion) {
        *self.pending() = Some(PendingImage {
            url: url.to_string(),
            version,
        });
    }

    fn signal_upgrade_request(&self) -> bool {
        if self.is_blocked() {
            warn!(
                "firmware upgrades blocked after {} failures",
                self.settings.fw_upgrade_failures()
            );
            self.outbox.push(
                FirmwareUpdateStatus {
                    state: FirmwareUpgradeState::Failed,
                    failure_reason: FirmwareFailureReason::Blocked,
                    retry_count: self.settings.fw_upgrade_failures(),
                }
                .build(),
            );
            return false;
        }
        if self.pending().is_none() || self.running.load(Ordering::Acquire) {
            return false;
        }
        self.status_requests.push(ConnectionStatusChangeRequest::FwUpgradeReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::settings::MemorySettings;

    struct Downloader(Result<u64, FirmwareFailureReason>);

    impl FirmwareDownloader for Downloader {
        fn download_and_apply(&self, _: &str) -> Result<u64, FirmwareFailureReason> {
            self.0
        }
    }

    struct Fixture {
        settings: Arc<MemorySettings>,
        requests: Arc<Queue<ConnectionStatusChangeRequest>>,
        outbox: Arc<Queue<FrameBuilderUser>>,
        upgrade: FirmwareUpgradeController,
    }

    fn fixture() -> Fixture {
        let settings = Arc::new(MemorySettings::default());
        let requests = Arc::new(Queue::new(4));
        let outbox = Arc::new(Queue::new(4));
        let upgrade = FirmwareUpgradeController::new(settings.clone(), requests.clone(), outbox.clone());
        upgrade.set_url(
            "https://fw.example/image.bin",
            FirmwareVersion {
                major: 2,
                minor: 0,
                patch: 0,
            },
        );
        Fixture {
            settings,
            requests,
            outbox,
            upgrade,
        }
    }

    #[test]
    fn signal_asks_connection_controller_for_upgrade_state() {
        let fixture = fixture();

        assert!(fixture.upgrade.signal_upgrade_request());
        assert_eq!(
            fixture.requests.try_pop(),
            Some(ConnectionStatusChangeRequest::FwUpgradeReady)
        );
    }

    #[test]
    fn failure_is_counted_and_reported() {
        let fixture = fixture();

        assert!(fixture
            .upgrade
            .run_upgrade(&Downloader(Err(FirmwareFailureReason::ImageInvalid))));

        assert_eq!(fixture.upgrade.state(), FirmwareUpgradeState::Failed);
        assert_eq!(fixture.settings.fw_upgrade_failures(), 1);
        let report = fixture.outbox.try_pop().unwrap();
        assert_eq!(report.as_bytes(), &[0x00, 0x02, 4, 2, 1]);
    }

    #[test]
    fn success_clears_failure_history() {
        let fixture = fixture();
        fixture.settings.set_fw_upgrade_failures(2);

        fixture.upgrade.run_upgrade(&Downloader(Ok(1024)));

        assert_eq!(fixture.upgrade.state(), FirmwareUpgradeState::Completed);
        assert_eq!(fixture.settings.fw_upgrade_failures(), 0);
        assert_eq!(fixture.outbox.try_pop().unwrap().as_bytes(), &[0x00, 0x02, 3, 0, 0]);
    }

    #[test]
    fn repeated_failures_block_requests() {
        let fixture = fixture();
        fixture.settings.set_fw_upgrade_failures(MAX_UPGRADE_FAILURES);

        assert!(!fixture.upgrade.signal_upgrade_request());
        assert_eq!(fixture.requests.num_waiting(), 0);
        assert_eq!(fixture.outbox.try_pop().unwrap().as_bytes()[3], 4);
    }
}
