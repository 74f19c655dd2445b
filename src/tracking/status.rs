/// Default status for a series without an explicit entry
pub const CONTINUING: &str = "continuing";

/// Status written by the drop toggle and the import heuristics
pub const STOPPED: &str = "stopped";

/// Synonyms meaning the user deliberately stopped following a series
pub const STOPPED_FAMILY: &[&str] = &[
    "stopped",
    "stoped",
    "dropped",
    "abandoned",
    "parada",
    "descontinuada",
    "abandonada",
];

/// Remote statuses meaning no further episodes will air
pub const ENDED_FAMILY: &[&str] = &["ended", "canceled", "cancelled"];

pub fn normalize(status: &str) -> String {
    status.trim().to_lowercase()
}

pub fn is_stopped(status: &str) -> bool {
    STOPPED_FAMILY.contains(&normalize(status).as_str())
}

pub fn is_ended(status: &str) -> bool {
    ENDED_FAMILY.contains(&normalize(status).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_family() {
        assert!(is_stopped("stopped"));
        assert!(is_stopped("  Dropped "));
        assert!(is_stopped("ABANDONADA"));
        assert!(is_stopped("stoped"));
        assert!(!is_stopped("continuing"));
        assert!(!is_stopped("ended"));
    }

    #[test]
    fn test_ended_family() {
        assert!(is_ended("Ended"));
        assert!(is_ended("Canceled"));
        assert!(is_ended("cancelled"));
        assert!(!is_ended("Returning Series"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Continuing\n"), "continuing");
    }
}
