use rusqlite::ErrorCode;

use parley_types::ChatError;

/// Map a storage error onto the client-facing taxonomy.
///
/// A `ChatError` raised inside a query closure passes through unchanged.
/// SQLite BUSY/LOCKED become `Transient`; anything else is `Internal`.
pub fn classify(err: anyhow::Error) -> ChatError {
    let err = match err.downcast::<ChatError>() {
        Ok(chat) => return chat,
        Err(err) => err,
    };

    if err.downcast_ref::<rusqlite::Error>().is_some_and(is_busy) {
        return ChatError::Transient("database is busy".to_string());
    }

    ChatError::Internal(format!("{:#}", err))
}

pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn chat_errors_pass_through() {
        let err = anyhow::Error::from(ChatError::Forbidden("not yours".into()));
        assert_eq!(classify(err), ChatError::Forbidden("not yours".into()));
    }

    #[test]
    fn busy_is_transient() {
        let err = anyhow::Error::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(classify(err).is_transient());
    }

    #[test]
    fn other_failures_are_internal() {
        let err = anyhow::anyhow!("boom");
        assert!(matches!(classify(err), ChatError::Internal(_)));
        assert!(is_unique_violation(&sqlite_failure(
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )));
    }
}
