use rsocket_core::{Payload, RSocketError, Responder};
use rsocket_flowable::{Flowable, Single};
use tracing::info;

/// 最小示例处理器。
///
/// 只有 fire-and-forget 与 request/stream 成功：前者记录日志，后者回应 `"Hello "`、`"world!"`
/// 两个元素；其余交互一律以 APPLICATION_ERROR 失败，便于客户端观察错误路径。
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleResponder;

fn make(data: &'static str) -> Payload {
    Payload::from(data).with_metadata("")
}

fn log_request(kind: &'static str, payload: &Payload) {
    info!(
        interaction = kind,
        data = payload.data_utf8().unwrap_or("null"),
        metadata = payload.metadata_utf8().unwrap_or("null"),
        "request received"
    );
}

impl Responder for SimpleResponder {
    fn fire_and_forget(&self, payload: Payload) -> Result<(), RSocketError> {
        log_request("fnf", &payload);
        Ok(())
    }

    fn request_response(&self, payload: Payload) -> Single<Payload, RSocketError> {
        log_request("request_response", &payload);
        Single::error(RSocketError::application("request/response is not supported"))
    }

    fn request_stream(&self, payload: Payload) -> Flowable<Payload, RSocketError> {
        log_request("request_stream", &payload);
        Flowable::just([make("Hello "), make("world!")])
    }

    fn request_channel(
        &self,
        _inbound: Flowable<Payload, RSocketError>,
    ) -> Flowable<Payload, RSocketError> {
        Flowable::error(RSocketError::application("request/channel is not supported"))
    }

    fn metadata_push(&self, payload: Payload) -> Single<(), RSocketError> {
        log_request("metadata_push", &payload);
        Single::error(RSocketError::application("metadata push is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsocket_core::ErrorCode;
    use rsocket_flowable::test_util::TestSubscriber;
    use tracing_test::traced_test;

    #[test]
    fn stream_says_hello_world() {
        let subscriber = TestSubscriber::<Payload, RSocketError>::new(8);
        SimpleResponder
            .request_stream(Payload::from("greet"))
            .subscribe(subscriber.clone());
        let items: Vec<_> = subscriber
            .items()
            .iter()
            .map(|item| item.data_utf8().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(items, ["Hello ", "world!"]);
        assert!(subscriber.is_complete());
    }

    #[test]
    fn unsupported_interactions_fail() {
        let (tx, rx) = std::sync::mpsc::channel();
        SimpleResponder
            .request_response(Payload::from("ping"))
            .subscribe_fn(|_| {}, move |err: RSocketError| {
                let _ = tx.send(err.code());
            });
        assert_eq!(rx.try_recv(), Ok(ErrorCode::ApplicationError));

        let channel = TestSubscriber::<Payload, RSocketError>::new(1);
        SimpleResponder
            .request_channel(Flowable::empty())
            .subscribe(channel.clone());
        assert_eq!(
            channel.error().map(|err| err.code()),
            Some(ErrorCode::ApplicationError)
        );
    }

    #[test]
    #[traced_test]
    fn fire_and_forget_is_logged() {
        SimpleResponder
            .fire_and_forget(Payload::from("note"))
            .expect("accepted");
        assert!(logs_contain("request received"));
        assert!(logs_contain("fnf"));
    }
}
