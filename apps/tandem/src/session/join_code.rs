use rand::Rng;

use super::record::SessionId;

/// Crockford-style alphabet without 0/1/I/O so codes survive being read aloud.
const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const JOIN_CODE_LEN: usize = 10;
const JOIN_URI_PREFIX: &str = "tandem://join/";

pub fn generate() -> SessionId {
    let mut rng = rand::thread_rng();
    let code: String = (0..JOIN_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    SessionId::new(code)
}

/// Scannable form of the join code, meant to be rendered as a QR code.
pub fn join_uri(id: &SessionId) -> String {
    format!("{JOIN_URI_PREFIX}{id}")
}

/// Grouped for display, e.g. `ABCDE-FGHJK`.
pub fn display(id: &SessionId) -> String {
    let code = id.as_str();
    if code.len() == JOIN_CODE_LEN && code.is_ascii() {
        format!("{}-{}", &code[..5], &code[5..])
    } else {
        code.to_string()
    }
}

/// Turns whatever the user typed or scanned into a lookup key.
///
/// Accepts the join URI, grouped or lower-case codes, and ids issued by older
/// stores (kept verbatim). Returns `None` for input that cannot be an id at all.
pub fn normalize(input: &str) -> Option<SessionId> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix(JOIN_URI_PREFIX).unwrap_or(trimmed);

    let compact: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();
    if compact.len() == JOIN_CODE_LEN && compact.bytes().all(|b| ALPHABET.contains(&b)) {
        return Some(SessionId::new(compact));
    }

    let verbatim_ok = !trimmed.is_empty()
        && trimmed.len() <= 128
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    verbatim_ok.then(|| SessionId::new(trimmed))
}
