//! Background worker driving discovery and health checks.
//!
//! The worker starts paused. The connection controller steers it through a
//! single-slot command queue; the latest command always replaces any pending
//! one.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::cloud::{DiscoveryService, HealthCheckService, TimeSource, FULL_HEALTH};
use crate::config::CloudServiceConfig;
use crate::queue::Queue;
use crate::settings::Settings;
use crate::time::SystemClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudServiceCommand {
    Pause,
    Unpause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthOutcome {
    Healthy,
    Exhausted,
    Paused,
}

pub struct CloudService {
    config: CloudServiceConfig,
    discovery: DiscoveryService,
    health_check: HealthCheckService,
    time_source: Arc<dyn TimeSource>,
    settings: Arc<dyn Settings>,
    clock: Arc<dyn SystemClock>,
    commands: Queue<CloudServiceCommand>,
    paused: AtomicBool,
    discovery_succeeded: AtomicBool,
    health: AtomicU8,
}

impl CloudService {
    pub fn new(
        config: CloudServiceConfig,
        discovery: DiscoveryService,
        health_check: HealthCheckService,
        time_source: Arc<dyn TimeSource>,
        settings: Arc<dyn Settings>,
        clock: Arc<dyn SystemClock>,
    ) -> Self {
        Self {
            config,
            discovery,
            health_check,
            time_source,
            settings,
            clock,
            commands: Queue::new(1),
            paused: AtomicBool::new(true),
            discovery_succeeded: AtomicBool::new(false),
            health: AtomicU8::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn discovery_succeeded(&self) -> bool {
        self.discovery_succeeded.load(Ordering::Acquire)
    }

    pub fn health(&self) -> u8 {
        self.health.load(Ordering::Acquire)
    }

    pub fn request_pause(&self) {
        if self.is_paused() {
            return;
        }
        debug!("cloud service pause requested");
        self.commands.replace(CloudServiceCommand::Pause);
    }

    pub fn request_unpause(&self) {
        if !self.is_paused() {
            return;
        }
        debug!("cloud service unpause requested");
        self.commands.replace(CloudServiceCommand::Unpause);
    }

    /// Runs iterations until the thread dies when `eternal`, otherwise one.
    pub fn run(&self, eternal: bool) {
        loop {
            self.run_iteration(eternal);
            if !eternal {
                return;
            }
        }
    }

    fn run_iteration(&self, eternal: bool) {
        self.discovery_succeeded.store(false, Ordering::Release);
        self.health.store(0, Ordering::Release);

        if self.is_paused() {
            self.wait_for_unpause();
        }

        loop {
            if !self.time_source.sync_time() {
                debug!("sntp sync failed, using current clock");
            }
            self.publish_local_time();

            if self.discovery.discover() {
                self.discovery_succeeded.store(true, Ordering::Release);
                break;
            }
            if self.check_for_pause_request(self.config.discovery_retry_interval_ms) {
                self.enter_pause();
                return;
            }
        }

        match self.health_check_with_backoff() {
            HealthOutcome::Paused => {
                self.enter_pause();
                return;
            }
            HealthOutcome::Exhausted => {
                error!("health check retries exhausted");
                // TODO: reboot here once product confirms exhaustion is fatal.
            }
            HealthOutcome::Healthy => info!("cloud reports full health"),
        }

        while eternal {
            if self.check_for_pause_request(self.config.health_check_interval_ms) {
                self.enter_pause();
                return;
            }
            self.health_check_once();
        }
    }

    fn enter_pause(&self) {
        info!("cloud service paused");
        self.paused.store(true, Ordering::Release);
    }

    fn wait_for_unpause(&self) {
        let poll = Duration::from_millis(self.config.unpause_poll_interval_ms);
        loop {
            match self.commands.pop(poll) {
                Some(CloudServiceCommand::Unpause) => break,
                Some(CloudServiceCommand::Pause) => debug!("already paused"),
                None => debug!("cloud service still paused"),
            }
        }
        info!("cloud service unpaused");
        self.paused.store(false, Ordering::Release);
    }

    /// True when a pause command arrived within `timeout_ms`. Any other
    /// command found instead is dropped.
    fn check_for_pause_request(&self, timeout_ms: u64) -> bool {
        match self.commands.pop(Duration::from_millis(timeout_ms)) {
            Some(CloudServiceCommand::Pause) => true,
            Some(other) => {
                debug!("discarding {other:?} while running");
                false
            }
            None => false,
        }
    }

    fn publish_local_time(&self) {
        let offset = self.settings.utc_offset_secs();
        match self.clock.now_local(offset) {
            Some(now) => self.settings.set_local_time(now),
            None => warn!("cannot derive local time for offset {offset}s"),
        }
    }

    fn health_check_once(&self) -> u8 {
        let health = match self.health_check.check() {
            Ok(health) => health,
            Err(err) => {
                warn!("{err}");
                0
            }
        };
        self.health.store(health, Ordering::Release);
        health
    }

    fn health_check_with_backoff(&self) -> HealthOutcome {
        for round in 0..self.config.health_tries_with_backoff {
            for attempt in 0..self.config.health_tries_without_backoff {
                if self.health_check_once() == FULL_HEALTH {
                    return HealthOutcome::Healthy;
                }
                debug!("health check attempt {attempt} of round {round} not healthy");
                if self.check_for_pause_request(self.config.health_retry_interval_ms) {
                    return HealthOutcome::Paused;
                }
            }
            warn!("health check round {round} failed, backing off");
            if self.check_for_pause_request(self.config.health_backoff_interval_ms) {
                return HealthOutcome::Paused;
            }
        }
        HealthOutcome::Exhausted
    }
}
