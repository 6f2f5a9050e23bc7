use rsocket_core::{Payload, RSocketError, Responder};
use rsocket_flowable::{Flowable, Single};
use tracing::info;

/// 回显处理器。
///
/// - request/response：原样返回；
/// - request/stream：数据为 `"<text>:<n>"` 时回显 `n` 次 `text`，否则回显一次；
/// - request/channel：逐个回显输入；
/// - fire-and-forget 与 metadata push：只写日志。
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoResponder;

/// 单次流式回显的上限。
const MAX_REPEAT: usize = 1_000;

fn parse_repeat(payload: &Payload) -> (String, usize) {
    let text = payload.data_utf8().unwrap_or_default();
    match text.rsplit_once(':') {
        Some((body, count)) => match count.parse::<usize>() {
            Ok(count) => (body.to_owned(), count.min(MAX_REPEAT)),
            Err(_) => (text.to_owned(), 1),
        },
        None => (text.to_owned(), 1),
    }
}

impl Responder for EchoResponder {
    fn fire_and_forget(&self, payload: Payload) -> Result<(), RSocketError> {
        info!(data = payload.data_utf8().unwrap_or("<binary>"), "fire-and-forget received");
        Ok(())
    }

    fn request_response(&self, payload: Payload) -> Single<Payload, RSocketError> {
        Single::of(payload)
    }

    fn request_stream(&self, payload: Payload) -> Flowable<Payload, RSocketError> {
        let (text, count) = parse_repeat(&payload);
        Flowable::just((0..count).map(move |_| Payload::from(text.clone())))
    }

    fn request_channel(
        &self,
        inbound: Flowable<Payload, RSocketError>,
    ) -> Flowable<Payload, RSocketError> {
        inbound
    }

    fn metadata_push(&self, payload: Payload) -> Single<(), RSocketError> {
        info!(
            metadata = payload.metadata_utf8().unwrap_or("<binary>"),
            "metadata push received"
        );
        Single::of(())
    }
}
