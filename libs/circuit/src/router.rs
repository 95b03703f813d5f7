use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use circuit_core::channel::{direct_channel, reply_channel_for};
use circuit_core::{
    subscribe_handler, Envelope, Error, RequestHandler, Result, SubscribeHandler, Subscription,
};

use crate::link::Link;
use crate::options::RespondOptions;

/// Outstanding request: expiry timer plus the one-shot resolver
///
/// Whoever removes the entry from the table (reply, timeout or
/// disconnect) owns the single resolution.
struct Pending {
    timer: AbortHandle,
    resolve: oneshot::Sender<Result<Envelope>>,
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

/// Whole milliseconds of `ttl`, saturating for durations beyond `u64`
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn lock(pending: &Mutex<HashMap<String, Pending>>) -> MutexGuard<'_, HashMap<String, Pending>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request/reply correlation over the circuit's private reply channel
pub struct Router {
    link: Link,
    reply_to: String,
    pending: PendingTable,
}

impl Router {
    /// Subscribe the reply dispatcher on `$router.<circuit id>`
    pub(crate) async fn bind(link: Link) -> Result<Self> {
        let reply_to = reply_channel_for(link.circuit_id());
        let pending = PendingTable::default();

        let table = pending.clone();
        let reply_subscription = Subscription::new(subscribe_handler(move |reply| {
            dispatch(&table, reply);
            async {}
        }));
        link.subscribe(&reply_to, reply_subscription).await?;

        Ok(Self {
            link,
            reply_to,
            pending,
        })
    }

    /// The private reply channel every request is stamped with
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Number of requests still waiting for a reply
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send `request` to `<recipient>.<channel>` and wait for the reply
    ///
    /// Fails with `Timeout` when no reply arrives within `ttl`.
    pub async fn create_request_handler(
        &self,
        mut request: Envelope,
        ttl: Duration,
    ) -> Result<Envelope> {
        let recipient = request
            .recipient
            .clone()
            .ok_or_else(|| Error::not_found(request.channel.clone()))?;
        let address = direct_channel(&recipient, &request.channel);

        request.reply_to = Some(self.reply_to.clone());
        request.time_to_live = Some(ttl_millis(ttl));

        let request_id = request.id.clone();
        let (resolve, resolution) = oneshot::channel();

        {
            // The timer cannot remove the entry before it is inserted
            let mut pending = lock(&self.pending);
            let table = self.pending.clone();
            let id = request_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let expired = lock(&table).remove(&id);
                if let Some(entry) = expired {
                    debug!(request = %id, ?ttl, "Request timed out");
                    let _ = entry.resolve.send(Err(Error::Timeout {
                        request_id: id,
                        ttl,
                    }));
                }
            });
            pending.insert(
                request_id.clone(),
                Pending {
                    timer: timer.abort_handle(),
                    resolve,
                },
            );
        }

        trace!(request = %request_id, address = %address, "Sending request");
        if let Err(e) = self.link.send(&address, request).await {
            if let Some(entry) = lock(&self.pending).remove(&request_id) {
                entry.timer.abort();
            }
            return Err(e);
        }

        resolution.await.unwrap_or(Err(Error::NotConnected))
    }

    /// Wrap `handler` so each request it receives is answered on the
    /// request's `reply_to` channel
    ///
    /// With a concurrency limit, at most that many handler calls run at
    /// once; later requests wait their turn in arrival order and none are
    /// dropped.
    pub fn create_responder(
        &self,
        handler: RequestHandler,
        options: &RespondOptions,
    ) -> SubscribeHandler {
        let link = self.link.clone();

        match options.limit() {
            Some(limit) => {
                let pool = Arc::new(Semaphore::new(limit));
                subscribe_handler(move |request| {
                    let pool = pool.clone();
                    let link = link.clone();
                    let handler = handler.clone();
                    async move {
                        // Admission happens on the delivery task, so arrival
                        // order is kept while the pool is full
                        let Ok(permit) = pool.acquire_owned().await else {
                            return;
                        };
                        tokio::spawn(async move {
                            answer(&link, &handler, request).await;
                            drop(permit);
                        });
                    }
                })
            }
            None => subscribe_handler(move |request| {
                let link = link.clone();
                let handler = handler.clone();
                async move {
                    tokio::spawn(async move { answer(&link, &handler, request).await });
                }
            }),
        }
    }

    /// Cancel every expiry timer and fail every outstanding request with
    /// `NotConnected`
    pub fn disconnect(&self) {
        let drained: Vec<(String, Pending)> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing in-flight requests");
        }

        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.resolve.send(Err(Error::NotConnected));
        }
    }
}

/// Resolve the pending request a reply answers; strays are dropped
fn dispatch(pending: &Mutex<HashMap<String, Pending>>, reply: Envelope) {
    let Some(request_id) = reply.reply_for.as_deref() else {
        trace!(id = %reply.id, "Non-reply on reply channel dropped");
        return;
    };

    let entry = lock(pending).remove(request_id);
    match entry {
        Some(entry) => {
            entry.timer.abort();
            let _ = entry.resolve.send(Ok(reply));
        }
        None => trace!(request = request_id, "Stray reply dropped"),
    }
}

async fn answer(link: &Link, handler: &RequestHandler, request: Envelope) {
    let Some(reply_to) = request.reply_to.clone() else {
        warn!(request = %request.id, "Request without reply channel dropped");
        return;
    };
    let request_id = request.id.clone();
    let requester = request.sender.clone();

    let content = match handler(request).await {
        Ok(content) => content,
        Err(e) => {
            warn!(request = %request_id, error = %e, "Responder failed, no reply sent");
            return;
        }
    };

    let mut response = Envelope::new();
    response.reply_for = Some(request_id);
    response.recipient = Some(requester);
    response.content = content;

    if let Err(e) = link.publish(&reply_to, response).await {
        warn!(channel = %reply_to, error = %e, "Reply could not be published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_core::{request_handler, Transport};
    use circuit_fabric::MemoryTransport;
    use serde_json::json;
    use std::time::Instant;
    use tokio::sync::mpsc;

    async fn connected() -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect().await.unwrap();
        transport
    }

    async fn router(id: &str, transport: &Arc<MemoryTransport>) -> Router {
        Router::bind(Link::new(id, transport.clone())).await.unwrap()
    }

    fn request(recipient: &str, channel: &str) -> Envelope {
        let mut req = Envelope::new();
        req.sender = "r1".to_string();
        req.recipient = Some(recipient.to_string());
        req.channel = channel.to_string();
        req
    }

    #[tokio::test]
    async fn binds_a_private_reply_channel() {
        let t = connected().await;
        let r = router("node1", &t).await;

        assert_eq!(r.reply_to(), "$router.node1");
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn ttl_saturates_instead_of_wrapping() {
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(ttl_millis(Duration::from_micros(999)), 0);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
        assert_eq!(ttl_millis(Duration::from_secs(u64::MAX / 1000 + 1)), u64::MAX);
    }

    #[tokio::test]
    async fn packages_the_request_and_times_out() {
        let t = connected().await;
        let r = router("r1", &t).await;

        let ttl = Duration::from_millis(50);
        let started = Instant::now();
        let result = r.create_request_handler(request("r2", "sum"), ttl).await;

        assert!(started.elapsed() >= ttl);
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(r.pending(), 0);

        // Nobody listens on r2.sum, so the stamped request is still queued
        assert_eq!(t.queued("r2.sum"), 1);
    }

    #[tokio::test]
    async fn stamps_reply_to_and_ttl() {
        let t = connected().await;
        let r = router("r1", &t).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        t.subscribe(
            "r2.sum",
            Subscription::new(subscribe_handler(move |req| {
                let _ = tx.send(req);
                async {}
            })),
        )
        .await
        .unwrap();

        let _ = r
            .create_request_handler(request("r2", "sum"), Duration::from_millis(20))
            .await;

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.reply_to.as_deref(), Some("$router.r1"));
        assert_eq!(seen.time_to_live, Some(20));
        assert_eq!(seen.channel, "sum");
    }

    #[tokio::test]
    async fn requires_a_recipient() {
        let t = connected().await;
        let r = router("r1", &t).await;

        let mut req = request("r2", "sum");
        req.recipient = None;
        let result = r.create_request_handler(req, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn responder_answers_on_reply_channel() {
        let t = connected().await;
        let r = Arc::new(router("r1", &t).await);

        let responder = r.create_responder(
            request_handler(|req| async move {
                let n: i64 = req.content_as()?;
                Ok(json!(n * 2))
            }),
            &RespondOptions::default(),
        );
        t.subscribe("r1.double", Subscription::new(responder))
            .await
            .unwrap();

        let mut req = request("r1", "double");
        req.content = json!(21);
        let req_id = req.id.clone();
        let reply = r
            .create_request_handler(req, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.content, json!(42));
        assert_eq!(reply.reply_for.as_deref(), Some(req_id.as_str()));
        assert_eq!(reply.recipient.as_deref(), Some("r1"));
        assert_eq!(reply.channel, "$router.r1");
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn stray_replies_are_ignored() {
        let t = connected().await;
        let r = router("r1", &t).await;

        let mut stray = Envelope::new();
        stray.reply_for = Some("unknown".to_string());
        t.publish("$router.r1", stray).await.unwrap();
        t.publish("$router.r1", Envelope::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_requests() {
        let t = connected().await;
        let r = Arc::new(router("r1", &t).await);

        let inflight = {
            let r = r.clone();
            tokio::spawn(async move {
                r.create_request_handler(request("r2", "slow"), Duration::from_secs(60))
                    .await
            })
        };

        while r.pending() == 0 {
            tokio::task::yield_now().await;
        }
        r.disconnect();

        let result = tokio::time::timeout(Duration::from_secs(1), inflight)
            .await
            .expect("request hung after disconnect")
            .unwrap();
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn failing_handler_sends_no_reply() {
        let t = connected().await;
        let r = Arc::new(router("r1", &t).await);

        let responder = r.create_responder(
            request_handler(|_| async { Err(Error::Handler("boom".to_string())) }),
            &RespondOptions::default(),
        );
        t.subscribe("r1.fail", Subscription::new(responder))
            .await
            .unwrap();

        let result = r
            .create_request_handler(request("r1", "fail"), Duration::from_millis(50))
            .await;
        assert!(result.unwrap_err().is_timeout());
    }
}
