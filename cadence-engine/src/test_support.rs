//! In-process doubles for the transport and auth seams.

use std::cell::{Cell, RefCell};

use chrono::{DateTime, Utc};

use cadence_core::wire::{CalendarSnapshot, SyncRequest, SyncResponse};

use crate::auth::{AuthProvider, Session};
use crate::transport::{SyncTransport, TransportError};

pub(crate) struct FakeTransport {
    pub requests: RefCell<Vec<SyncRequest>>,
    pub push_count: Cell<usize>,
    /// Yield to the runtime before replying, so a second future can run
    /// while this push is "on the wire".
    pub yield_before_reply: Cell<bool>,
    /// `None` makes every push fail with a network error.
    pub response: RefCell<Option<SyncResponse>>,
    pub calendar: RefCell<Option<CalendarSnapshot>>,
    pub calendar_months: RefCell<Vec<String>>,
}

impl FakeTransport {
    pub fn replying(server_time: DateTime<Utc>) -> Self {
        Self::with_response(Some(SyncResponse {
            server_time,
            goals: vec![],
            completions: vec![],
        }))
    }

    pub fn failing() -> Self {
        Self::with_response(None)
    }

    pub fn with_response(response: Option<SyncResponse>) -> Self {
        Self {
            requests: RefCell::new(Vec::new()),
            push_count: Cell::new(0),
            yield_before_reply: Cell::new(false),
            response: RefCell::new(response),
            calendar: RefCell::new(None),
            calendar_months: RefCell::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> SyncRequest {
        self.requests.borrow().last().cloned().unwrap()
    }
}

impl SyncTransport for FakeTransport {
    async fn push_batch(
        &self,
        _access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        self.requests.borrow_mut().push(request.clone());
        self.push_count.set(self.push_count.get() + 1);
        if self.yield_before_reply.get() {
            tokio::task::yield_now().await;
        }
        let response = self.response.borrow().clone();
        response.ok_or_else(|| TransportError::Network("connection refused".to_string()))
    }

    async fn fetch_calendar(
        &self,
        _access_token: &str,
        month: &str,
    ) -> Result<CalendarSnapshot, TransportError> {
        self.calendar_months.borrow_mut().push(month.to_string());
        let snapshot = self.calendar.borrow().clone();
        snapshot.ok_or_else(|| TransportError::Network("connection refused".to_string()))
    }
}

pub(crate) struct FakeAuth {
    pub session: Option<Session>,
}

impl FakeAuth {
    pub fn signed_in() -> Self {
        Self {
            session: Some(Session {
                user_id: "user-1".to_string(),
                access_token: "token-1".to_string(),
            }),
        }
    }

    pub fn guest() -> Self {
        Self { session: None }
    }
}

impl AuthProvider for FakeAuth {
    fn session(&self) -> Option<Session> {
        self.session.clone()
    }
}
