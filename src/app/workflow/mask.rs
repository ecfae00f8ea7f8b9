use crate::app::error::AppError;

const MASK_CHAR: char = '*';
const VISIBLE_PREFIX: usize = 4;
const VISIBLE_SUFFIX: usize = 4;

/// Renders an account identifier with the interior masked: the first and
/// last four characters stay visible, everything between becomes `*`.
///
/// The same rendering serves two purposes: it keeps identifiers out of
/// logs in clear form, and it is the exact string the broker app shows in
/// its account selector, so row matching compares against it directly.
/// Identifiers shorter than eight characters are rejected outright; a
/// partial mask would leak most of the identifier.
pub fn mask_identifier(input: &str, trace_id: &str) -> Result<String, AppError> {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() < VISIBLE_PREFIX + VISIBLE_SUFFIX {
        return Err(AppError::validation(
            "Identifier too short to mask",
            trace_id,
        ));
    }
    let masked: String = chars
        .iter()
        .enumerate()
        .map(|(index, ch)| {
            if index < VISIBLE_PREFIX || index >= chars.len() - VISIBLE_SUFFIX {
                *ch
            } else {
                MASK_CHAR
            }
        })
        .collect();
    Ok(masked)
}
