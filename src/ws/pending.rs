//! Outstanding correlated requests, keyed by `requestId`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use super::message::Envelope;
use crate::Result;
use crate::error::{Error, Rejected};

type Reply = oneshot::Sender<Result<Envelope>>;

#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    requests: DashMap<String, Reply>,
}

impl PendingRequests {
    /// Registers `request_id`. At most one request per id may be outstanding.
    pub(crate) fn register(&self, request_id: &str) -> Result<oneshot::Receiver<Result<Envelope>>> {
        match self.requests.entry(request_id.to_owned()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "request {request_id} is already pending"
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Completes the request `envelope` answers, if any is waiting for it.
    ///
    /// A non-empty `error` field rejects the request. Envelopes that match nothing (including
    /// late replies to requests that already timed out) are handed back.
    pub(crate) fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let Some(request_id) = envelope.request_id.as_deref() else {
            return Some(envelope);
        };
        let Some((request_id, reply)) = self.requests.remove(request_id) else {
            return Some(envelope);
        };

        let outcome = match envelope.error_message().map(str::to_owned) {
            Some(message) => Err(Rejected {
                request_id,
                message,
            }
            .into()),
            None => Ok(envelope),
        };
        // The caller may have given up already; that is not an error here.
        _ = reply.send(outcome);
        None
    }

    pub(crate) fn remove(&self, request_id: &str) -> bool {
        self.requests.remove(request_id).is_some()
    }

    /// Fails every outstanding request with a cancellation tagged `reason`.
    pub(crate) fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self
            .requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, reply)) = self.requests.remove(&id) {
                _ = reply.send(Err(Error::cancelled(reason)));
                cancelled += 1;
            }
        }
        cancelled
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Cancelled, Kind};
    use crate::ws::message::MessageType;

    fn response(request_id: &str, error: Option<&str>) -> Envelope {
        let mut envelope = Envelope::request(MessageType::Response, None);
        envelope.request_id = Some(request_id.to_owned());
        envelope.error = error.map(str::to_owned);
        envelope
    }

    #[tokio::test]
    async fn resolves_matching_reply() {
        let pending = PendingRequests::default();
        let rx = pending.register("r-1").expect("register");

        assert!(pending.resolve(response("r-1", None)).is_none());
        let reply = rx.await.expect("sender kept").expect("ok");
        assert_eq!(reply.request_id.as_deref(), Some("r-1"));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn error_field_rejects() {
        let pending = PendingRequests::default();
        let rx = pending.register("r-1").expect("register");

        assert!(pending.resolve(response("r-1", Some("simulator busy"))).is_none());

        let err = rx.await.expect("sender kept").unwrap_err();
        assert_eq!(err.kind(), Kind::Rejected);
        assert_eq!(
            err.downcast_ref::<Rejected>().expect("rejected").message,
            "simulator busy"
        );
    }

    #[test]
    fn duplicate_request_id_is_refused() {
        let pending = PendingRequests::default();
        let _rx = pending.register("r-1").expect("register");

        let err = pending.register("r-1").unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn late_reply_is_ignored() {
        let pending = PendingRequests::default();
        let _rx = pending.register("r-1").expect("register");
        assert!(pending.remove("r-1"));

        assert!(pending.resolve(response("r-1", None)).is_some());
        assert!(pending.resolve(response("never-sent", None)).is_some());
    }

    #[tokio::test]
    async fn cancel_all_tags_reason() {
        let pending = PendingRequests::default();
        let a = pending.register("a").expect("register");
        let b = pending.register("b").expect("register");

        assert_eq!(pending.cancel_all("logout"), 2);

        for rx in [a, b] {
            let err = rx.await.expect("sender kept").unwrap_err();
            assert_eq!(err.kind(), Kind::Cancelled);
            assert_eq!(err.downcast_ref::<Cancelled>().expect("cancelled").reason, "logout");
        }
        assert_eq!(pending.len(), 0);
    }
}
