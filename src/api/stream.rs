//! Purpose: Expose a request's payload stream as a typed async stream.
//! Exports: `ResponseEvent`, `ResponseStream`, `Engine::request_stream`.
//! Role: Channel form of the callback protocol for Rust callers.
//! Invariants: The terminal event is the last item; the stream ends right after it.
use crate::core::dispatch::Engine;
use crate::core::invoker::ResponseHandler;
use crate::core::kind::ResponseKind;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseEvent {
    pub request_id: u32,
    pub kind: ResponseKind,
    pub payload: Bytes,
    pub finished: bool,
}

pub struct ResponseStream {
    inner: UnboundedReceiverStream<ResponseEvent>,
}

impl Stream for ResponseStream {
    type Item = ResponseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct ChannelHandler {
    tx: Mutex<Option<UnboundedSender<ResponseEvent>>>,
}

impl ResponseHandler for ChannelHandler {
    fn on_response(&self, request_id: u32, payload: &[u8], kind: ResponseKind, finished: bool) {
        let mut slot = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = slot.as_ref() else {
            return;
        };
        let _ = tx.send(ResponseEvent {
            request_id,
            kind,
            payload: Bytes::copy_from_slice(payload),
            finished,
        });
        if finished {
            slot.take();
        }
    }
}

impl Engine {
    /// Submits a request and returns its payloads as a stream.
    pub fn request_stream(
        &self,
        context_id: u32,
        function: &str,
        params: impl Into<Bytes>,
        request_id: u32,
    ) -> ResponseStream {
        let (tx, rx) = unbounded_channel();
        self.request(
            context_id,
            function,
            params,
            request_id,
            ChannelHandler {
                tx: Mutex::new(Some(tx)),
            },
        );
        ResponseStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{Engine, EngineOptions, Error, FunctionTable, Reply, ResponseKind};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn stream_ends_after_terminal() {
        let mut table = FunctionTable::new();
        table.register_async("count", |call| async move {
            for i in 0..3u8 {
                call.sink().emit([i])?;
            }
            Ok::<_, Error>(Reply::success(b"done".to_vec()))
        });
        let engine =
            Engine::with_options(table, EngineOptions::new().with_worker_threads(1)).expect("engine");
        let ctx = engine.create_context(Vec::new()).expect("context");

        let events = engine
            .request_stream(ctx.id(), "count", Vec::new(), 9)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 4);
        for (i, event) in events[..3].iter().enumerate() {
            assert_eq!(event.kind, ResponseKind::custom());
            assert_eq!(event.payload.as_ref(), &[i as u8]);
            assert!(!event.finished);
        }
        assert_eq!(events[3].kind, ResponseKind::Success);
        assert_eq!(events[3].payload.as_ref(), b"done");
        assert!(events[3].finished);
    }

    #[tokio::test]
    async fn invalid_context_yields_single_error_event() {
        let engine = Engine::new(FunctionTable::with_builtins()).expect("engine");
        let events = engine
            .request_stream(404, "client.version", Vec::new(), 1)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ResponseKind::Error);
        assert!(events[0].finished);
    }
}
