// Expression functions embedded in SET values (§4.11). A single regex
// matches the innermost (no nested parens) function call each pass, so
// `UPPER(HASH(%name))` evaluates `HASH` before `UPPER` without a real
// parser: repeat substitution until no call remains.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use mgin_base::{err, Result};
use rand::Rng;
use regex::Regex;
use sha2::Digest;

/// Replace every `%field` placeholder with the stringified value of that
/// field in the parent document, before any function is evaluated.
pub fn substitute_placeholders(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let re = Regex::new(r"%([a-zA-Z0-9_:]+)").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        lookup(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Evaluate every embedded function call, innermost first, until the
/// value contains no more recognized calls.
pub fn evaluate_functions(input: &str) -> Result<String> {
    let call_re = Regex::new(r"(?i)([A-Z0-9_]+)\(([^()]*)\)").unwrap();
    let mut current = input.to_string();
    loop {
        let caps = match call_re.captures(&current) {
            Some(c) => c,
            None => break,
        };
        let name = caps[1].to_uppercase();
        let args_str = caps[2].to_string();
        let replacement = match call_function(&name, &args_str) {
            Some(r) => r?,
            None => break,
        };
        let whole = caps.get(0).unwrap();
        current.replace_range(whole.range(), &replacement);
    }
    Ok(current)
}

fn split_args(s: &str) -> Vec<String> {
    s.split(',').map(|a| a.trim().to_string()).collect()
}

fn call_function(name: &str, args: &str) -> Option<Result<String>> {
    match name {
        "BASE64" => Some(Ok(BASE64_STANDARD.encode(args.as_bytes()))),
        "HASH" => Some(Ok(sha256_hex(args))),
        "MD5" => Some(Ok(md5_hex(args))),
        "CHECKSUM" => Some(checksum(args)),
        "RANDOM" => Some(random_alnum(args)),
        "UPPER" => Some(Ok(args.to_uppercase())),
        "LOWER" => Some(Ok(args.to_lowercase())),
        "UUID" => Some(Ok(uuid::Uuid::new_v4().to_string())),
        "TIMESTAMP" => Some(timestamp(args)),
        "ROUND" => Some(round_decimal(args, false)),
        "DECIMAL" => Some(round_decimal(args, true)),
        _ => None,
    }
}

fn sha256_hex(s: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(s.as_bytes());
    hex_encode(&hasher.finalize())
}

fn sha1_hex(s: &str) -> String {
    use sha1::Sha1;
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    hex_encode(&hasher.finalize())
}

fn md5_hex(s: &str) -> String {
    let digest = md5::Md5::digest(s.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn checksum(args: &str) -> Result<String> {
    let parts = split_args(args);
    if parts.len() != 2 {
        return Err(err("CHECKSUM requires algo,value"));
    }
    let algo = parts[0].to_uppercase();
    let value = &parts[1];
    match algo.as_str() {
        "CRC32" => {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(value.as_bytes());
            Ok(format!("{:08x}", hasher.finalize()))
        }
        "SHA1" => Ok(sha1_hex(value)),
        "SHA256" => Ok(sha256_hex(value)),
        other => Err(err(format!("Unsupported checksum algorithm {other}"))),
    }
}

fn random_alnum(args: &str) -> Result<String> {
    let n: usize = args.trim().parse().map_err(|_| err("RANDOM requires a length"))?;
    const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    Ok((0..n)
        .map(|_| ALNUM[rng.gen_range(0..ALNUM.len())] as char)
        .collect())
}

fn timestamp(args: &str) -> Result<String> {
    let now: DateTime<Utc> = Utc::now();
    match args.trim().to_lowercase().as_str() {
        "unix" | "" => Ok(now.timestamp().to_string()),
        "full" => Ok(now.format("%Y-%m-%d %H:%M:%S").to_string()),
        "date" => Ok(now.format("%Y-%m-%d").to_string()),
        "time" => Ok(now.format("%H:%M:%S").to_string()),
        other => Err(err(format!("Unsupported TIMESTAMP format {other}"))),
    }
}

fn round_decimal(args: &str, always_decimal: bool) -> Result<String> {
    let parts = split_args(args);
    if parts.len() != 2 {
        return Err(err("Expected value,decimals"));
    }
    let value: f64 = parts[0].parse().map_err(|_| err("Invalid numeric value"))?;
    let decimals: usize = parts[1].parse().map_err(|_| err("Invalid decimal count"))?;
    let factor = 10f64.powi(decimals as i32);
    let rounded = (value * factor).round() / factor;
    if always_decimal || decimals > 0 {
        Ok(format!("{rounded:.decimals$}"))
    } else {
        Ok(format!("{rounded}"))
    }
}

/// Extract a trailing `EXPIRE(n)` from a SET value, returning the
/// remaining text and the parsed number of seconds, if present.
pub fn extract_expire(input: &str) -> (String, Option<i64>) {
    let re = Regex::new(r"(?i)\s*EXPIRE\((\d+)\)").unwrap();
    if let Some(caps) = re.captures(input) {
        let secs: i64 = caps[1].parse().unwrap_or(0);
        let stripped = re.replace(input, "").trim().to_string();
        (stripped, Some(secs))
    } else {
        (input.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_sha256() {
        let a = evaluate_functions("HASH(hello)").unwrap();
        let b = evaluate_functions("HASH(hello)").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn base64_roundtrips_through_evaluate() {
        let out = evaluate_functions("BASE64(hi)").unwrap();
        assert_eq!(out, BASE64_STANDARD.encode("hi"));
    }

    #[test]
    fn upper_and_lower_are_idempotent() {
        let once = evaluate_functions("UPPER(abc)").unwrap();
        assert_eq!(once, "ABC");
        assert_eq!(once.to_uppercase(), once);
    }

    #[test]
    fn nested_calls_evaluate_innermost_first() {
        let out = evaluate_functions("UPPER(LOWER(ABC))").unwrap();
        assert_eq!(out, "ABC");
    }

    #[test]
    fn extract_expire_strips_trailing_clause() {
        let (rest, secs) = extract_expire("30 EXPIRE(60)");
        assert_eq!(rest, "30");
        assert_eq!(secs, Some(60));
    }

    #[test]
    fn placeholders_substitute_from_lookup() {
        let out = substitute_placeholders("hello %name", |f| {
            (f == "name").then(|| "Ana".to_string())
        });
        assert_eq!(out, "hello Ana");
    }

    #[test]
    fn checksum_crc32_is_deterministic() {
        let a = evaluate_functions("CHECKSUM(CRC32,hello)").unwrap();
        let b = evaluate_functions("CHECKSUM(CRC32,hello)").unwrap();
        assert_eq!(a, b);
    }
}
