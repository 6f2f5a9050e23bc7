use rsocket_core::TransportError;
use std::io;
use tracing::debug;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "rsocket.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为传输错误；错误码写入调试日志，便于按操作聚合。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    debug!(
        code = kind.code,
        transient = is_transient(&error),
        error = %error,
        "{} failed",
        kind.message
    );
    TransportError::io(kind.message, error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> TransportError {
    map_io_error(
        kind,
        io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", kind.message)),
    )
}

/// 对端或网络的瞬时故障，重试可能成功。
pub(crate) fn is_transient(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_the_operation_label() {
        let err = map_io_error(
            CONNECT,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        match err {
            TransportError::Io { operation, source } => {
                assert_eq!(operation, "tcp connect");
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn permission_errors_are_not_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
