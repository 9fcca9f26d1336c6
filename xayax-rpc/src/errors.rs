//! RPC error codes & their handling.

use jsonrpc_core::ErrorCode;

/// Legacy daemon RPC error codes that GSPs expect.
///
/// Only the codes actually produced by this interface are listed.
#[derive(Clone, Copy, Debug, Default)]
pub enum LegacyCode {
    /// Catch-all application error.
    #[default]
    Misc = -1,
    /// Invalid address or block hash.
    InvalidAddressOrKey = -5,
    /// Invalid, missing or out-of-range parameter.
    InvalidParameter = -8,
}

impl From<LegacyCode> for ErrorCode {
    fn from(code: LegacyCode) -> Self {
        Self::ServerError(code as i64)
    }
}

/// Maps errors into [`jsonrpc_core::Error`] responses.
pub(crate) trait MapError<T>: Sized {
    /// Maps an error to a response with the given code.
    fn map_error(self, code: impl Into<ErrorCode>) -> Result<T, jsonrpc_core::Error>;

    /// Maps an error to an internal JSON-RPC error, used for wrapped
    /// upstream and storage failures.
    fn map_internal_error(self) -> Result<T, jsonrpc_core::Error> {
        self.map_error(ErrorCode::InternalError)
    }
}

impl<T, E> MapError<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn map_error(self, code: impl Into<ErrorCode>) -> Result<T, jsonrpc_core::Error> {
        self.map_err(|err| jsonrpc_core::Error {
            code: code.into(),
            message: err.to_string(),
            data: None,
        })
    }
}

/// Converts `Option`s into [`jsonrpc_core::Error`] responses with a given
/// code and message when the value is absent.
pub(crate) trait OkOrError<T>: Sized {
    /// Converts to a response, erroring with `code` and `message` on `None`.
    fn ok_or_error(
        self,
        code: impl Into<ErrorCode>,
        message: impl ToString,
    ) -> Result<T, jsonrpc_core::Error>;
}

impl<T> OkOrError<T> for Option<T> {
    fn ok_or_error(
        self,
        code: impl Into<ErrorCode>,
        message: impl ToString,
    ) -> Result<T, jsonrpc_core::Error> {
        self.ok_or(jsonrpc_core::Error {
            code: code.into(),
            message: message.to_string(),
            data: None,
        })
    }
}
