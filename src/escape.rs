//! Literal escaping under the server's `no_backslash_escapes` setting.

use crate::connection::with_conn;
use crate::errors::Result;
use crate::handle::ConnId;
use crate::retry;
use crate::wire::DbParam;

/// Where [`escape_string`] takes its escape mode from: a live connection
/// (fetched lazily from the server on first use), or a fixed mode that
/// short-circuits the lookup.
#[derive(Debug, Clone, Copy)]
pub enum EscapeSource {
    Connection(ConnId),
    NoBackslashEscapes(bool),
}

impl From<ConnId> for EscapeSource {
    fn from(conn: ConnId) -> Self {
        EscapeSource::Connection(conn)
    }
}

impl From<bool> for EscapeSource {
    fn from(no_backslash_escapes: bool) -> Self {
        EscapeSource::NoBackslashEscapes(no_backslash_escapes)
    }
}

/// Escapes `text` for embedding in a single-quoted SQL literal.
///
/// Quotes are always doubled. When the server interprets backslash escapes
/// (`no_backslash_escapes` off), NUL, CR, LF and backslash are replaced by
/// their two-character escape forms as well.
pub async fn escape_string(source: impl Into<EscapeSource>, text: &str) -> Result<String> {
    match source.into() {
        EscapeSource::NoBackslashEscapes(mode) => Ok(escape(text, mode)),
        EscapeSource::Connection(conn) => {
            let text = text.to_owned();
            with_conn(conn, move |session, state| {
                Box::pin(async move {
                    let mode = match state.no_backslash_escapes {
                        Some(mode) => mode,
                        None => {
                            state.set_query_deadline(None);
                            let result = retry::retryable(session, state, None, |state| {
                                Box::pin(async move {
                                    let timeout = state.remaining_time()?;
                                    state
                                        .wire()?
                                        .get_db_parameter(DbParam::NoBackslashEscapes, timeout)
                                        .await
                                })
                            })
                            .await;
                            state.clear_deadline();
                            let mode = result? != 0;
                            state.no_backslash_escapes = Some(mode);
                            mode
                        }
                    };
                    Ok(escape(&text, mode))
                })
            })
            .await
        }
    }
}

fn escape(text: &str, no_backslash_escapes: bool) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\0' if !no_backslash_escapes => out.push_str("\\0"),
            '\r' if !no_backslash_escapes => out.push_str("\\r"),
            '\n' if !no_backslash_escapes => out.push_str("\\n"),
            '\\' if !no_backslash_escapes => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_are_always_doubled() {
        assert_eq!(escape("O'Brien", true), "O''Brien");
        assert_eq!(escape("O'Brien", false), "O''Brien");
    }

    #[test]
    fn specials_escape_only_in_backslash_mode() {
        assert_eq!(escape("O'Brien\n", true), "O''Brien\n");
        assert_eq!(escape("O'Brien\n", false), "O''Brien\\n");
        assert_eq!(escape("a\\b\r\0", false), "a\\\\b\\r\\0");
        assert_eq!(escape("a\\b", true), "a\\b");
    }

    #[test]
    fn re_escaping_doubles_quotes_again() {
        // every quote is doubled, with no detection of quotes that are
        // already escaped; re-escaped text stays well formed (even quote
        // runs) but is NOT left unchanged
        let once = escape("it's", true);
        assert_eq!(once, "it''s");
        let twice = escape(&once, true);
        assert_eq!(twice, "it''''s");
        assert!(twice.matches('\'').count() % 2 == 0);
    }

    #[tokio::test]
    async fn pseudo_sources_short_circuit() {
        assert_eq!(escape_string(true, "a\nb").await.unwrap(), "a\nb");
        assert_eq!(escape_string(false, "a\nb").await.unwrap(), "a\\nb");
    }
}
