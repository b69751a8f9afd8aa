//! Line-level gcode handling: the fixed commands the fleet sends on its
//! own behalf, comment stripping, and telemetry parsing.
//!
//! `;` introduces a comment. Everything here works on trimmed single lines;
//! the wire framing (newline termination) lives in [crate::device].

/// Home all axes. Sent (with [EXTRUDE_RESET]) while initializing a printer.
pub const HOME_ALL: &str = "G28";

/// Reset the extruder's logical position.
pub const EXTRUDE_RESET: &str = "G92 E0";

/// Filament change; parks the head and waits for the operator.
pub const FILAMENT_CHANGE: &str = "M600";

/// Commands run to park and cool the device after a job ends abnormally.
pub const ENDING_SEQUENCE: &[&str] = &[
    "M104 S0", // hotend off
    "M140 S0", // bed off
    "G91",
    "G1 E-3 F1800", // retract
    "G90",
    "G28 X Y",
    "M84", // motors off
];

/// Substring acknowledging the last command.
pub const ACK_TOKEN: &str = "ok";

/// Substring marking a device-reported error (matched case-insensitively).
pub const ERROR_TOKEN: &str = "error";

/// Mark emitted while a heating-wait command holds the device.
pub const HEATING_WAIT_TOKEN: &str = "W:";

/// Drop an inline comment, returning the command part trimmed. A pure
/// comment line becomes the empty string.
pub fn strip_comment(line: &str) -> &str {
    match line.split_once(';') {
        Some((command, _)) => command.trim(),
        None => line.trim(),
    }
}

/// Split a gcode file into the command lines that actually get sent:
/// inline comments stripped, blank and pure-comment lines dropped.
pub fn command_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(strip_comment)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// The comment lines of a gcode file (slicers embed duration estimates in
/// them), with the leading `;` removed and trimmed.
pub fn comment_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.starts_with(';')
                .then(|| line.trim_start_matches(';').trim().to_string())
        })
        .collect()
}

/// Whether the line (an already-stripped command) triggers the
/// operator-assisted pause.
pub fn is_filament_change(line: &str) -> bool {
    line.eq_ignore_ascii_case(FILAMENT_CHANGE)
}

/// Pull the extruder/bed temperature pair out of a telemetry response of
/// the `T:<n> ... B:<n>` form. Both fields must be present.
pub fn parse_temperatures(response: &str) -> Option<(f64, f64)> {
    let mut extruder = None;
    let mut bed = None;
    for token in response.split_whitespace() {
        if let Some(value) = token.strip_prefix("T:") {
            extruder = value.parse::<f64>().ok().or(extruder);
        } else if let Some(value) = token.strip_prefix("B:") {
            bed = value.parse::<f64>().ok().or(bed);
        }
    }
    Some((extruder?, bed?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_inline_comments_and_blank_lines() {
        let content = "; generated by a slicer\nG28 ; home\n\nG1 X10 Y10\n;TIME:90\n   \n";
        assert_eq!(command_lines(content), vec!["G28".to_string(), "G1 X10 Y10".to_string()]);
    }

    #[test]
    fn comment_lines_keep_annotations() {
        let content = ";FLAVOR:Marlin\n;TIME:3661\nG28\n";
        assert_eq!(
            comment_lines(content),
            vec!["FLAVOR:Marlin".to_string(), "TIME:3661".to_string()]
        );
    }

    #[test]
    fn temperature_pairs_need_both_fields() {
        assert_eq!(parse_temperatures("ok T:210.4 /210.0 B:60.1 /60.0"), Some((210.4, 60.1)));
        assert_eq!(parse_temperatures("T:201.3 E:0 W:29"), None);
        assert_eq!(parse_temperatures("echo:busy processing"), None);
    }

    #[test]
    fn filament_change_is_case_insensitive() {
        assert!(is_filament_change("M600"));
        assert!(is_filament_change("m600"));
        assert!(!is_filament_change("M601"));
    }
}
