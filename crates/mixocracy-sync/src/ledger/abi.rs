// ABI encoding for the voting contract: fixed selector table, call encoding,
// and return-data decoding for the shapes the contract emits.

use thiserror::Error;

use super::types::Address;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    /// `0x` result. The node returns this when the selector does not exist on
    /// the contract, so it is never a valid "zero" value.
    #[error("empty return data")]
    Empty,

    #[error("return data truncated: need {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("integer at offset {offset} does not fit in 64 bits")]
    Overflow { offset: usize },

    #[error("invalid utf-8 in string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

// ---------------------------------------------------------------------------
// Selector table
// ---------------------------------------------------------------------------

/// A contract function: its canonical signature and the first four bytes of
/// the keccak256 hash of that signature.
///
/// Selectors are precomputed. Changing a signature means recomputing the
/// selector and checking it against a deployed contract; a mismatch makes
/// every call return empty data with no error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    pub signature: &'static str,
    pub selector: [u8; 4],
}

pub const VOTE: Function = Function {
    signature: "vote(address,uint256)",
    selector: [0x5f, 0x74, 0xbb, 0xde],
};
pub const UNVOTE: Function = Function {
    signature: "unvote(address,uint256)",
    selector: [0x02, 0xaa, 0x9b, 0xe2],
};
pub const GET_VOTES: Function = Function {
    signature: "getVotes(address,uint256)",
    selector: [0xeb, 0x90, 0x19, 0xd4],
};
pub const HAS_VOTED: Function = Function {
    signature: "hasVoted(address,address,uint256)",
    selector: [0xa1, 0x87, 0x30, 0x2b],
};
pub const GET_SONG: Function = Function {
    signature: "getSong(address,uint256)",
    selector: [0xa4, 0xa2, 0x29, 0xcb],
};
pub const GET_SONG_COUNT: Function = Function {
    signature: "getSongCount(address)",
    selector: [0xe8, 0x77, 0x1f, 0xbe],
};
pub const GET_ALL_SONGS_WITH_VOTES: Function = Function {
    signature: "getAllSongsWithVotes(address)",
    selector: [0x47, 0xf8, 0xdc, 0x84],
};
pub const IS_SONG_REMOVED: Function = Function {
    signature: "isSongRemoved(address,uint256)",
    selector: [0x59, 0xd2, 0x38, 0x66],
};
pub const ADD_SONG: Function = Function {
    signature: "addSong(string)",
    selector: [0x7f, 0x59, 0x0f, 0x5e],
};
pub const REMOVE_SONG: Function = Function {
    signature: "removeSong(uint256)",
    selector: [0xd4, 0x34, 0x2c, 0xc7],
};
pub const START_SET: Function = Function {
    signature: "startSet(address)",
    selector: [0xb4, 0xd6, 0xb5, 0x62],
};
pub const STOP_SET: Function = Function {
    signature: "stopSet(address)",
    selector: [0x6b, 0x41, 0xc1, 0x69],
};
pub const IS_SET_ACTIVE: Function = Function {
    signature: "isSetActive(address)",
    selector: [0x2e, 0x81, 0x78, 0x2f],
};
pub const GET_ACTIVE_DJS: Function = Function {
    signature: "getActiveDjs()",
    selector: [0x9a, 0x70, 0x9f, 0xa4],
};

/// Every function the client calls, for lookup by signature.
pub const FUNCTIONS: &[Function] = &[
    VOTE,
    UNVOTE,
    GET_VOTES,
    HAS_VOTED,
    GET_SONG,
    GET_SONG_COUNT,
    GET_ALL_SONGS_WITH_VOTES,
    IS_SONG_REMOVED,
    ADD_SONG,
    REMOVE_SONG,
    START_SET,
    STOP_SET,
    IS_SET_ACTIVE,
    GET_ACTIVE_DJS,
];

pub fn lookup(signature: &str) -> Option<&'static Function> {
    FUNCTIONS.iter().find(|f| f.signature == signature)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// A call argument. `Str` is encoded in the tail with an offset in the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Address(Address),
    Uint(u64),
    Str(&'a str),
}

const WORD: usize = 32;

fn uint_word(n: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&n.to_be_bytes());
    word
}

/// Encode a call: selector, one head word per argument, then the tail of
/// dynamic values.
pub fn encode_call(function: &Function, args: &[Arg<'_>]) -> Vec<u8> {
    let mut head = Vec::with_capacity(args.len() * WORD);
    let mut tail = Vec::new();
    for arg in args {
        match arg {
            Arg::Address(addr) => {
                let mut word = [0u8; WORD];
                word[12..].copy_from_slice(addr.as_bytes());
                head.extend_from_slice(&word);
            }
            Arg::Uint(n) => head.extend_from_slice(&uint_word(*n)),
            Arg::Str(s) => {
                let offset = (args.len() * WORD + tail.len()) as u64;
                head.extend_from_slice(&uint_word(offset));
                tail.extend_from_slice(&uint_word(s.len() as u64));
                tail.extend_from_slice(s.as_bytes());
                tail.resize(tail.len().next_multiple_of(WORD), 0);
            }
        }
    }
    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&function.selector);
    out.extend(head);
    out.extend(tail);
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], AbiError> {
    let end = offset.checked_add(WORD).ok_or(AbiError::Overflow { offset })?;
    data.get(offset..end).ok_or(AbiError::Truncated {
        offset,
        needed: WORD,
        len: data.len(),
    })
}

fn uint_at(data: &[u8], offset: usize) -> Result<u64, AbiError> {
    let word = word_at(data, offset)?;
    if word[..24].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow { offset });
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(buf))
}

fn usize_at(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let n = uint_at(data, offset)?;
    usize::try_from(n).map_err(|_| AbiError::Overflow { offset })
}

fn string_at(data: &[u8], offset: usize) -> Result<String, AbiError> {
    let len = usize_at(data, offset)?;
    let start = add(offset, WORD)?;
    let end = add(start, len)?;
    let bytes = data.get(start..end).ok_or(AbiError::Truncated {
        offset: start,
        needed: len,
        len: data.len(),
    })?;
    String::from_utf8(bytes.to_vec()).map_err(|_| AbiError::InvalidUtf8 { offset: start })
}

fn non_empty(data: &[u8]) -> Result<&[u8], AbiError> {
    if data.is_empty() {
        Err(AbiError::Empty)
    } else {
        Ok(data)
    }
}

pub fn decode_bool(data: &[u8]) -> Result<bool, AbiError> {
    Ok(uint_at(non_empty(data)?, 0)? != 0)
}

pub fn decode_uint(data: &[u8]) -> Result<u64, AbiError> {
    uint_at(non_empty(data)?, 0)
}

/// Decode a single dynamic `string` return value.
pub fn decode_string(data: &[u8]) -> Result<String, AbiError> {
    let data = non_empty(data)?;
    let offset = usize_at(data, 0)?;
    string_at(data, offset)
}

/// Element count of a dynamic array whose length word sits at `offset`,
/// checked against the words actually present after it.
fn array_len(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let count = usize_at(data, offset)?;
    let available = data.len().saturating_sub(offset + WORD) / WORD;
    if count > available {
        return Err(AbiError::Truncated {
            offset: offset + WORD,
            needed: count.saturating_mul(WORD),
            len: data.len(),
        });
    }
    Ok(count)
}

fn add(a: usize, b: usize) -> Result<usize, AbiError> {
    a.checked_add(b).ok_or(AbiError::Overflow { offset: a })
}

/// Decode an `address[]` return value.
pub fn decode_address_array(data: &[u8]) -> Result<Vec<Address>, AbiError> {
    let data = non_empty(data)?;
    let offset = usize_at(data, 0)?;
    let count = array_len(data, offset)?;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let word = word_at(data, add(offset, WORD * (i + 1))?)?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        out.push(Address::from_bytes(bytes));
    }
    Ok(out)
}

/// Decode the `(uint256,string,uint256)[]` rows of `getAllSongsWithVotes`:
/// `(id, name, votes)` per song.
pub fn decode_song_rows(data: &[u8]) -> Result<Vec<(u64, String, u64)>, AbiError> {
    let data = non_empty(data)?;
    let array = usize_at(data, 0)?;
    let count = array_len(data, array)?;
    // Tuple offsets are relative to the first word after the length.
    let heads = add(array, WORD)?;
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let tuple = add(heads, usize_at(data, add(heads, WORD * i)?)?)?;
        let id = uint_at(data, tuple)?;
        let name_offset = usize_at(data, add(tuple, WORD)?)?;
        let name = string_at(data, add(tuple, name_offset)?)?;
        let votes = uint_at(data, add(tuple, 2 * WORD)?)?;
        rows.push((id, name, votes));
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Hex helpers
// ---------------------------------------------------------------------------

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, AbiError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map_err(|_| AbiError::InvalidHex(s.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
