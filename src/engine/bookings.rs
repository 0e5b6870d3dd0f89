use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::BookingStore;

use super::{now_ms, Engine, EngineError};

#[async_trait]
impl BookingStore for Engine {
    async fn list_in_range(
        &self,
        subject: &str,
        from: Ms,
        to: Ms,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, EngineError> {
        let Some(st) = self.get_subject(subject) else {
            return Ok(Vec::new());
        };
        let guard = st.read().await;
        Ok(guard
            .starting_in(from, to)
            .filter(|b| status.is_none_or(|s| b.status == s))
            .cloned()
            .collect())
    }

    async fn list_all(&self, subject: &str) -> Result<Vec<Booking>, EngineError> {
        let Some(st) = self.get_subject(subject) else {
            return Ok(Vec::new());
        };
        let guard = st.read().await;
        Ok(guard.bookings.clone())
    }

    async fn reserve(
        &self,
        subject: &str,
        contact: String,
        slot: Slot,
        meta: BookingMeta,
    ) -> Result<Booking, EngineError> {
        let mut txn = self.begin(subject).await;
        if txn.state().bookings.len() >= MAX_BOOKINGS_PER_SUBJECT {
            return Err(EngineError::LimitExceeded("too many bookings for subject"));
        }
        // Unique key: (subject, start_at) among confirmed bookings.
        if let Some(existing) = txn.state().confirmed_at(slot.start_at) {
            tracing::debug!(
                "subject {subject}: start {} already held by booking {}",
                slot.start_at,
                existing.id
            );
            return Err(EngineError::SlotTaken);
        }

        let booking = Booking {
            id: Ulid::new(),
            subject_id: subject.to_string(),
            contact,
            start_at: slot.start_at,
            end_at: slot.end_at,
            status: BookingStatus::Confirmed,
            meta,
            created_at: now_ms(),
        };
        txn.commit(&Event::BookingConfirmed {
            booking: booking.clone(),
        })
        .await?;
        Ok(booking)
    }

    async fn cancel(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let mut txn = self.begin_for_booking(&booking_id).await?;
        let mut booking = txn
            .state()
            .bookings
            .iter()
            .find(|b| b.id == booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.is_confirmed() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }

        txn.commit(&Event::BookingCancelled {
            id: booking_id,
            subject_id: booking.subject_id.clone(),
        })
        .await?;
        booking.status = BookingStatus::Cancelled;
        Ok(booking)
    }
}
