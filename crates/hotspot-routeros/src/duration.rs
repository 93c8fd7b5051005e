//! RouterOS duration strings.
//!
//! The router prints durations as `1w2d3h4m5s`, sometimes with a trailing
//! clock part (`1d00:10:00`) or as a bare clock (`00:05:00`).

/// Parse a RouterOS duration to whole seconds. `None` when malformed.
pub fn parse_duration(input: &str) -> Option<u64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let (units, clock) = match input.rfind(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) if input[idx + 1..].contains(':') => (&input[..=idx], &input[idx + 1..]),
        Some(_) => (input, ""),
        None => ("", input),
    };

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in units.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            'w' => 7 * 86_400,
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total = total.checked_add(n.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        // a bare number is seconds
        total = total.checked_add(digits.parse().ok()?)?;
    }

    if !clock.is_empty() {
        total = total.checked_add(parse_clock(clock)?)?;
    }
    Some(total)
}

fn parse_clock(clock: &str) -> Option<u64> {
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let h: u64 = parts[0].parse().ok()?;
    let m: u64 = parts[1].parse().ok()?;
    let s: u64 = parts[2].split('.').next()?.parse().ok()?;
    Some(h * 3_600 + m * 60 + s)
}

/// Format seconds the way the router accepts them (`1d2h3m4s`, `0s`).
pub fn format_duration(secs: u64) -> String {
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    let mut rest = secs;
    for (unit, label) in [(86_400, 'd'), (3_600, 'h'), (60, 'm'), (1, 's')] {
        let n = rest / unit;
        if n > 0 {
            out.push_str(&n.to_string());
            out.push(label);
            rest %= unit;
        }
    }
    out
}
