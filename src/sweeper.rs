use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::auth::Actor;
use crate::engine::Engine;
use crate::observability;

/// Background task that marks approved bookings completed once their
/// interval has elapsed.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    let system = Actor::system();
    loop {
        interval.tick().await;
        let elapsed = engine.collect_elapsed_approved(Utc::now()).await;
        for booking_id in elapsed {
            match engine.complete_booking(&system, booking_id).await {
                Ok(()) => {
                    metrics::counter!(observability::SWEEPER_COMPLETIONS_TOTAL).increment(1);
                    info!("completed elapsed booking {booking_id}");
                }
                Err(e) => {
                    // May have been cancelled or completed in the meantime
                    tracing::debug!("sweeper skip {booking_id}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::auth::Role;
    use chrono::TimeDelta;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("labbook_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_completes_elapsed_bookings() {
        let path = test_journal_path("sweeper_collect.journal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let admin = Actor::new(Ulid::new(), Role::LabTechnician);
        let lab = engine
            .register_lab(&admin, "Physics Lab".into(), "Main".into(), 24, vec![])
            .await
            .unwrap();

        // Auto-approved (admin requester), ends two seconds from now
        let start = Utc::now() + TimeDelta::seconds(1);
        let booking = engine
            .request_booking(
                &admin,
                BookingRequest {
                    lab_id: lab.id,
                    range: TimeRange::new(start, start + TimeDelta::seconds(1)),
                    purpose: "calibration".into(),
                    frequency: None,
                    recurrence_until: None,
                    exception_reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(booking.status, BookingStatus::Approved);

        // Not elapsed yet
        assert!(engine.collect_elapsed_approved(Utc::now()).await.is_empty());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let elapsed = engine.collect_elapsed_approved(Utc::now()).await;
        assert_eq!(elapsed, vec![booking.id]);

        engine
            .complete_booking(&Actor::system(), booking.id)
            .await
            .unwrap();
        assert!(engine.collect_elapsed_approved(Utc::now()).await.is_empty());
        assert_eq!(
            engine.booking(booking.id).await.unwrap().status,
            BookingStatus::Completed
        );
    }
}
