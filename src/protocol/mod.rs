//! Wire-level pieces of the MAPI protocol: block framing, the v9 login
//! challenge, and the text encoding of result tuples.

pub mod block;
pub mod challenge;
pub mod fields;

/// First byte of a server prompt.
pub const PROMPT_BEGIN: u8 = 0x01;
/// Prompt line (newline stripped) asking for more input.
pub const PROMPT_MORE: &str = "\u{1}\u{2}";
/// Prompt line (newline stripped) asking for file content.
pub const PROMPT_FILE: &str = "\u{1}\u{3}";

/// Parameter placeholder in prepared query templates.
pub const PLACEHOLDER: char = '?';

/// Type of one result set, from the second byte of a `&` header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Table = 1,
    Update = 2,
    Schema = 3,
    Trans = 4,
    Prepare = 5,
    /// Continuation page of an earlier table result. Rewritten to
    /// [`QueryType::Table`] as soon as the header is parsed.
    Block = 6,
}

impl QueryType {
    pub fn from_code(code: i64) -> Option<QueryType> {
        match code {
            1 => Some(QueryType::Table),
            2 => Some(QueryType::Update),
            3 => Some(QueryType::Schema),
            4 => Some(QueryType::Trans),
            5 => Some(QueryType::Prepare),
            6 => Some(QueryType::Block),
            _ => None,
        }
    }
}

// How far the server's handshake-options level reaches: a setting may be
// sent inline during login only when the level is *greater* than its
// constant.
pub const HANDSHAKE_AUTOCOMMIT: i32 = 0;
pub const HANDSHAKE_REPLY_SIZE: i32 = 1;
pub const HANDSHAKE_SIZE_HEADER: i32 = 2;
pub const HANDSHAKE_COLUMNAR_PROTOCOL: i32 = 3;
pub const HANDSHAKE_TIME_ZONE: i32 = 4;
