//! Time-based message delivery for automations
//!
//! Automations declare schedules; the scheduler validates the
//! declarations, computes each next firing instant with timezone-correct
//! local-time math, and delivers the declared message to the automation's
//! mailbox. Invalid declarations are skipped with a warning and never
//! affect their siblings.

mod next_fire;

use std::time::Duration;

use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use mirai_config::Location;

pub use next_fire::{next_daily, next_solar, SolarEvent};

/// Retry interval when no solar event is currently computable
const DORMANT_RETRY: Duration = Duration::from_secs(24 * 60 * 60);

/// A schedule declaration attached to an automation
///
/// Declarations are plain data; the scheduler owns validation and timing.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleDecl {
    /// Fire every day at a local time-of-day
    Daily { at: NaiveTime, message: String },
    /// Fire at sunrise, shifted by the offset (may be negative)
    Sunrise { offset_minutes: i64, message: String },
    /// Fire at sunset, shifted by the offset (may be negative)
    Sunset { offset_minutes: i64, message: String },
    /// Fire on a fixed interval
    Every { interval_ms: u64, message: String },
}

impl ScheduleDecl {
    /// The message delivered to the automation when the schedule fires
    pub fn message(&self) -> &str {
        match self {
            Self::Daily { message, .. }
            | Self::Sunrise { message, .. }
            | Self::Sunset { message, .. }
            | Self::Every { message, .. } => message,
        }
    }

    /// Validate the declaration against the runtime configuration
    pub fn validate(&self, location: Option<Location>) -> Result<(), ScheduleError> {
        if self.message().is_empty() {
            return Err(ScheduleError::MissingMessage);
        }
        match self {
            Self::Every { interval_ms: 0, .. } => Err(ScheduleError::InvalidEvery),
            Self::Sunrise { .. } | Self::Sunset { .. } if location.is_none() => {
                Err(ScheduleError::MissingLocation)
            }
            _ => Ok(()),
        }
    }
}

/// Why a schedule declaration was rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("missing_message: schedule declares no message")]
    MissingMessage,

    #[error("invalid_every: interval must be a positive number of milliseconds")]
    InvalidEvery,

    #[error("missing_location: sunrise/sunset schedules need MIRAI_LATITUDE and MIRAI_LONGITUDE")]
    MissingLocation,
}

/// Everything needed to arm one automation's schedules
pub struct ArmRequest {
    /// Automation name, used in schedule ids and logs
    pub automation: String,
    /// Declarations in declaration order
    pub decls: Vec<ScheduleDecl>,
    /// The automation's scheduled-message mailbox
    pub mailbox: mpsc::Sender<String>,
}

/// The scheduler
pub struct Scheduler {
    tz: Tz,
    location: Option<Location>,
}

impl Scheduler {
    /// Create a scheduler for the given IANA timezone name and location
    ///
    /// An unresolvable timezone falls back to UTC with a warning.
    pub fn new(timezone: &str, location: Option<Location>) -> Self {
        Self {
            tz: resolve_timezone(timezone),
            location,
        }
    }

    /// The resolved timezone
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Validate and arm every schedule; one task per valid schedule
    pub fn start(
        &self,
        requests: Vec<ArmRequest>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for request in requests {
            for (index, decl) in request.decls.into_iter().enumerate() {
                let id = format!("{}/{}/{}", request.automation, decl.message(), index);

                if let Err(e) = decl.validate(self.location) {
                    warn!(schedule = %id, error = %e, "skipping invalid schedule");
                    continue;
                }

                handles.push(run_schedule(
                    id,
                    decl,
                    self.tz,
                    self.location,
                    request.mailbox.clone(),
                    shutdown.subscribe(),
                ));
            }
        }

        handles
    }
}

/// Resolve an IANA timezone name, warning and falling back to UTC when
/// the name is unknown
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown timezone, falling back to UTC");
        Tz::UTC
    })
}

/// Drive one schedule: arm, fire, rearm, forever
fn run_schedule(
    id: String,
    decl: ScheduleDecl,
    tz: Tz,
    location: Option<Location>,
    mailbox: mpsc::Sender<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = match next_delay(&decl, tz, location) {
                Some(wait) => wait,
                None => {
                    warn!(schedule = %id, "no upcoming solar event; retrying in 24h");
                    DORMANT_RETRY
                }
            };
            debug!(schedule = %id, seconds = wait.as_secs(), "schedule armed");

            tokio::select! {
                _ = sleep(wait) => {
                    if mailbox.try_send(decl.message().to_string()).is_err() {
                        warn!(schedule = %id, "automation mailbox unavailable; dropping scheduled message");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    })
}

/// Time to sleep before the schedule's next firing
fn next_delay(decl: &ScheduleDecl, tz: Tz, location: Option<Location>) -> Option<Duration> {
    let now = Utc::now();
    let instant = match decl {
        ScheduleDecl::Every { interval_ms, .. } => {
            return Some(Duration::from_millis(*interval_ms))
        }
        ScheduleDecl::Daily { at, .. } => next_daily(now, tz, *at),
        ScheduleDecl::Sunrise { offset_minutes, .. } => {
            next_solar(now, tz, location?, SolarEvent::Sunrise, *offset_minutes)?
        }
        ScheduleDecl::Sunset { offset_minutes, .. } => {
            next_solar(now, tz, location?, SolarEvent::Sunset, *offset_minutes)?
        }
    };
    Some((instant - now).to_std().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> Option<Location> {
        Some(Location {
            latitude: 50.08,
            longitude: 14.43,
        })
    }

    #[test]
    fn test_every_one_accepted_every_zero_rejected() {
        let ok = ScheduleDecl::Every {
            interval_ms: 1,
            message: "tick".into(),
        };
        assert_eq!(ok.validate(None), Ok(()));

        let bad = ScheduleDecl::Every {
            interval_ms: 0,
            message: "tick".into(),
        };
        assert_eq!(bad.validate(None), Err(ScheduleError::InvalidEvery));
    }

    #[test]
    fn test_missing_message_rejected() {
        let decl = ScheduleDecl::Daily {
            at: NaiveTime::from_hms_opt(13, 5, 0).unwrap(),
            message: String::new(),
        };
        assert_eq!(decl.validate(None), Err(ScheduleError::MissingMessage));
    }

    #[test]
    fn test_solar_without_location_rejected() {
        let decl = ScheduleDecl::Sunset {
            offset_minutes: -15,
            message: "dusk".into(),
        };
        assert_eq!(decl.validate(None), Err(ScheduleError::MissingLocation));
        assert_eq!(decl.validate(location()), Ok(()));
    }

    #[test]
    fn test_resolve_timezone_fallback() {
        assert_eq!(resolve_timezone("Europe/Prague").name(), "Europe/Prague");
        assert_eq!(resolve_timezone("Not/AZone"), Tz::UTC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_fires_and_rearms() {
        let scheduler = Scheduler::new("Europe/Prague", None);
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);

        let handles = scheduler.start(
            vec![ArmRequest {
                automation: "test".into(),
                decls: vec![ScheduleDecl::Every {
                    interval_ms: 1_000,
                    message: "tick".into(),
                }],
                mailbox: tx,
            }],
            &shutdown,
        );
        assert_eq!(handles.len(), 1);

        assert_eq!(rx.recv().await.unwrap(), "tick");
        assert_eq!(rx.recv().await.unwrap(), "tick");

        let _ = shutdown.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_schedule_skipped_others_armed() {
        let scheduler = Scheduler::new("Europe/Prague", None);
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);

        let handles = scheduler.start(
            vec![ArmRequest {
                automation: "test".into(),
                decls: vec![
                    ScheduleDecl::Every {
                        interval_ms: 0,
                        message: "never".into(),
                    },
                    ScheduleDecl::Every {
                        interval_ms: 500,
                        message: "still_ticking".into(),
                    },
                ],
                mailbox: tx,
            }],
            &shutdown,
        );

        // Only the valid declaration was armed
        assert_eq!(handles.len(), 1);
        assert_eq!(rx.recv().await.unwrap(), "still_ticking");

        let _ = shutdown.send(());
    }
}
