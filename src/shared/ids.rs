use getrandom::getrandom;

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RUN_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;
const RUN_ID_MAX_GENERATION_ATTEMPTS: usize = 16;

pub fn validate_run_id(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("run id must be non-empty".to_string());
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err("run id must use only ASCII letters, digits, '-' or '_'".to_string())
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

fn generate_run_id(now: i64) -> Result<String, String> {
    let timestamp = u64::try_from(now)
        .map_err(|_| "run id generation requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes)
        .map_err(|err| format!("failed to generate run id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % RUN_SUFFIX_SPACE;
    let ts = base36_encode_u64(timestamp);
    let suffix = base36_encode_fixed_u32(sample, 4);
    Ok(format!("run-{ts}-{suffix}"))
}

/// Allocate a run id that `exists` does not already know about.
pub fn allocate_run_id(now: i64, exists: impl Fn(&str) -> bool) -> Result<String, String> {
    for _ in 0..RUN_ID_MAX_GENERATION_ATTEMPTS {
        let run_id = generate_run_id(now)?;
        if !exists(&run_id) {
            return Ok(run_id);
        }
    }
    Err(format!(
        "failed to allocate unique run id after {RUN_ID_MAX_GENERATION_ATTEMPTS} attempts"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_well_formed() {
        let id = generate_run_id(1_700_000_000).expect("generate");
        assert!(id.starts_with("run-"));
        validate_run_id(&id).expect("valid");
        let suffix = id.rsplit('-').next().expect("suffix");
        assert_eq!(suffix.len(), 4);
    }

    #[test]
    fn allocation_retries_past_collisions() {
        let first = allocate_run_id(42, |_| false).expect("first");
        let second = allocate_run_id(42, |candidate| candidate == first).expect("second");
        assert_ne!(first, second);
    }

    #[test]
    fn negative_timestamps_are_rejected() {
        assert!(generate_run_id(-1).is_err());
    }
}
