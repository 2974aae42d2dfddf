use bridge_client::domain::Reading;

/// Phase number of a per-phase current key (`currentL1`, `current2`, any case).
fn current_phase(key: &str) -> Option<u32> {
    let lower = key.to_ascii_lowercase();
    let rest = lower.strip_prefix("current")?;
    let digits = rest.strip_prefix('l').unwrap_or(rest);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Derive apparent power per phase and move `voltagePhaseN` to `voltageLN`.
///
/// A phase is only touched when both its current and `voltagePhaseN` are
/// numeric. The source voltage key is consumed, so a second pass is a no-op.
pub fn normalize_phases(reading: &Reading) -> Reading {
    let mut out = reading.clone();

    for (key, phase) in reading.keys().filter_map(|k| current_phase(k).map(|n| (k, n))) {
        let voltage_key = format!("voltagePhase{phase}");
        let (Some(current), Some(voltage)) = (out.number(key), out.number(&voltage_key)) else {
            continue;
        };

        out.insert(format!("powerL{phase}"), current * voltage);
        out.insert(format!("voltageL{phase}"), voltage);
        out.remove(&voltage_key);
    }

    out
}
