//! Route exclusion calculator.
//!
//! The tunnel routes whatever its exit peer's allowed-IP list covers.
//! To route "everything except these networks", the full IPv4 space is
//! held as a list of disjoint inclusive ranges, each exclusion is
//! subtracted, and the survivors are re-expressed as the minimal set of
//! aligned CIDR blocks.
//!
//! Pure functions, no state; invalid exclusion entries are skipped.

use std::net::Ipv4Addr;
use tracing::debug;

/// Compute the allowed-IP list covering all of IPv4 except `exclusions`.
///
/// Each exclusion is a CIDR (`10.0.0.0/8`) or bare address (`10.1.2.3`,
/// treated as `/32`). The result is a comma-separated CIDR list; with no
/// valid exclusions it is exactly `0.0.0.0/0`.
pub fn allowed_ips_excluding<S: AsRef<str>>(exclusions: &[S]) -> String {
    let mut ranges: Vec<(u32, u32)> = vec![(0, u32::MAX)];

    for exclusion in exclusions {
        let Some((network, mask)) = parse_cidr(exclusion.as_ref()) else {
            debug!("Skipping invalid exclusion {:?}", exclusion.as_ref());
            continue;
        };
        let start = network & mask;
        let end = start | !mask;

        ranges = ranges
            .into_iter()
            .flat_map(|range| subtract(range, (start, end)))
            .collect();
    }

    let cidrs: Vec<String> = ranges
        .iter()
        .flat_map(|&(start, end)| range_to_cidrs(start, end))
        .collect();
    cidrs.join(", ")
}

/// Parse `a.b.c.d/len` (or `a.b.c.d`, defaulting to /32) into
/// `(network, mask)`. Returns `None` for anything malformed.
pub fn parse_cidr(cidr: &str) -> Option<(u32, u32)> {
    let mut parts = cidr.splitn(2, '/');
    let ip = parse_ipv4(parts.next()?)?;

    let prefix_len: u32 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 32,
    };
    if prefix_len > 32 {
        return None;
    }

    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Some((ip, mask))
}

/// Dotted-quad to host-order `u32`.
pub fn parse_ipv4(ip: &str) -> Option<u32> {
    ip.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Host-order `u32` back to dotted-quad.
pub fn ip_to_string(ip: u32) -> String {
    Ipv4Addr::from(ip).to_string()
}

/// Subtract `exclude` from `range`, yielding the 0, 1 or 2 sub-ranges
/// that remain. Ranges are inclusive on both ends.
fn subtract(range: (u32, u32), exclude: (u32, u32)) -> Vec<(u32, u32)> {
    let (r_start, r_end) = range;
    let (e_start, e_end) = exclude;

    if e_start > r_end || e_end < r_start {
        return vec![range];
    }

    let mut result = Vec::with_capacity(2);
    if e_start > r_start {
        result.push((r_start, e_start - 1));
    }
    if e_end < r_end {
        result.push((e_end + 1, r_end));
    }
    result
}

/// Express a contiguous inclusive range as the minimal set of aligned
/// CIDR blocks: greedily take the largest power-of-two block that is
/// both aligned at the cursor and fits before the range's end.
pub fn range_to_cidrs(start: u32, end: u32) -> Vec<String> {
    let mut cidrs = Vec::new();
    let mut current = start;

    while current <= end {
        // Alignment bounds the block; the range end may shrink it.
        let mut max_bits = current.trailing_zeros().min(32);
        while max_bits > 0 {
            let block_size = 1u64 << max_bits;
            if u64::from(current) + block_size - 1 <= u64::from(end) {
                break;
            }
            max_bits -= 1;
        }

        let prefix = 32 - max_bits;
        cidrs.push(format!("{}/{prefix}", ip_to_string(current)));

        let next = u64::from(current) + (1u64 << max_bits);
        if next > u64::from(u32::MAX) {
            break;
        }
        current = next as u32;
    }

    cidrs
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inclusive (start, end) of a CIDR string.
    fn cidr_bounds(cidr: &str) -> (u32, u32) {
        let (network, mask) = parse_cidr(cidr).unwrap();
        let start = network & mask;
        (start, start | !mask)
    }

    fn output_blocks(result: &str) -> Vec<(u32, u32)> {
        result.split(", ").map(cidr_bounds).collect()
    }

    #[test]
    fn test_no_exclusions_yields_default_route() {
        let empty: [&str; 0] = [];
        assert_eq!(allowed_ips_excluding(&empty), "0.0.0.0/0");
    }

    #[test]
    fn test_excluding_ten_slash_eight() {
        let result = allowed_ips_excluding(&["10.0.0.0/8"]);
        assert!(result.contains("11.0.0.0/8"));
        assert!(result.contains("0.0.0.0/5"));
        assert!(!result.contains("10.0.0.0"));
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            parse_cidr("192.168.1.0/24"),
            Some((0xC0A8_0100, 0xFFFF_FF00))
        );
        assert_eq!(parse_cidr("8.8.8.8"), Some((0x0808_0808, 0xFFFF_FFFF)));
        assert_eq!(parse_cidr("0.0.0.0/0"), Some((0, 0)));
        assert_eq!(parse_cidr("invalid"), None);
        assert_eq!(parse_cidr("10.0.0.0/33"), None);
        assert_eq!(parse_cidr("10.0.0/8"), None);
    }

    #[test]
    fn test_range_to_cidrs_aligned_block() {
        assert_eq!(
            range_to_cidrs(0xC0A8_0100, 0xC0A8_01FF),
            vec!["192.168.1.0/24".to_string()]
        );
    }

    #[test]
    fn test_range_to_cidrs_unaligned_range() {
        // 192.168.1.1..=192.168.1.4 needs four blocks.
        assert_eq!(
            range_to_cidrs(0xC0A8_0101, 0xC0A8_0104),
            vec![
                "192.168.1.1/32".to_string(),
                "192.168.1.2/31".to_string(),
                "192.168.1.4/32".to_string(),
            ]
        );
    }

    #[test]
    fn test_full_universe_round_trip() {
        assert_eq!(range_to_cidrs(0, u32::MAX), vec!["0.0.0.0/0".to_string()]);
    }

    #[test]
    fn test_output_is_disjoint_and_covers_complement() {
        let exclusions = ["10.0.0.0/8", "192.168.0.0/16", "172.16.0.0/12", "8.8.8.8"];
        let result = allowed_ips_excluding(&exclusions);

        let mut blocks = output_blocks(&result);
        blocks.sort();

        // Pairwise disjoint.
        for pair in blocks.windows(2) {
            assert!(pair[0].1 < pair[1].0, "overlap between {pair:?}");
        }

        // No block touches an excluded range.
        for exclusion in &exclusions {
            let (e_start, e_end) = cidr_bounds(exclusion);
            for &(b_start, b_end) in &blocks {
                assert!(b_end < e_start || b_start > e_end);
            }
        }

        // Union size equals the universe minus the exclusions.
        let covered: u64 = blocks
            .iter()
            .map(|&(s, e)| u64::from(e) - u64::from(s) + 1)
            .sum();
        let excluded: u64 = exclusions
            .iter()
            .map(|e| {
                let (s, end) = cidr_bounds(e);
                u64::from(end) - u64::from(s) + 1
            })
            .sum();
        assert_eq!(covered, (1u64 << 32) - excluded);
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let result = allowed_ips_excluding(&["bogus", "not/a/cidr", "10.0.0.0/8"]);
        assert_eq!(result, allowed_ips_excluding(&["10.0.0.0/8"]));
    }

    #[test]
    fn test_overlapping_exclusions() {
        // The narrower exclusion is inside the wider one; result equals
        // excluding just the wider range.
        let result = allowed_ips_excluding(&["10.0.0.0/8", "10.1.0.0/16"]);
        assert_eq!(result, allowed_ips_excluding(&["10.0.0.0/8"]));
    }
}
