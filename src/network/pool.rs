//! Subnet pool fed from bracket-range CIDR expressions
//!
//! `172.[128-130].0.0/24` expands to three /24 subnets. The pool hands them
//! out first-in first-out; a subnet that is checked out is absent from the
//! free list until it is released.

use crate::error::{FleetError, Result};
use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Prefix of runtime networks backed by a pool subnet
pub const NETWORK_PREFIX: &str = "flotilla_";

/// Expand a bracket-range expression into concrete subnets, in ascending order
pub fn parse_range_expression(expr: &str) -> Result<Vec<String>> {
    let mut subnets = Vec::new();
    expand(expr, expr, &mut subnets)?;
    Ok(subnets)
}

fn expand(current: &str, original: &str, out: &mut Vec<String>) -> Result<()> {
    let parse_error = |reason: String| FleetError::CidrParse {
        expr: original.to_string(),
        reason,
    };

    let Some(open) = current.find('[') else {
        validate_subnet(current).map_err(parse_error)?;
        out.push(current.to_string());
        return Ok(());
    };
    let close = current[open..]
        .find(']')
        .map(|offset| open + offset)
        .ok_or_else(|| parse_error("unterminated range".to_string()))?;

    let bounds: Vec<&str> = current[open + 1..close].split('-').collect();
    if bounds.len() != 2 {
        return Err(parse_error(format!(
            "range '{}' must be written as start-end",
            &current[open + 1..close]
        )));
    }
    let start: u32 = bounds[0]
        .parse()
        .map_err(|_| parse_error(format!("invalid range start '{}'", bounds[0])))?;
    let end: u32 = bounds[1]
        .parse()
        .map_err(|_| parse_error(format!("invalid range end '{}'", bounds[1])))?;
    if start > end {
        return Err(parse_error(format!("range start {} exceeds end {}", start, end)));
    }
    if end > 255 {
        return Err(parse_error(format!("range end {} exceeds 255", end)));
    }

    let (head, tail) = (&current[..open], &current[close + 1..]);
    for value in start..=end {
        expand(&format!("{}{}{}", head, value, tail), original, out)?;
    }
    Ok(())
}

fn validate_subnet(subnet: &str) -> std::result::Result<(), String> {
    let (addr, prefix) = subnet
        .split_once('/')
        .ok_or_else(|| format!("'{}' has no prefix length", subnet))?;
    addr.parse::<Ipv4Addr>()
        .map_err(|_| format!("'{}' is not an IPv4 address", addr))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("invalid prefix length '{}'", prefix))?;
    if prefix > 32 {
        return Err(format!("prefix length {} exceeds 32", prefix));
    }
    Ok(())
}

/// Runtime network name for a pool subnet
pub fn network_name_for(subnet: &str) -> String {
    format!("{}{}", NETWORK_PREFIX, subnet.replace(['.', '/'], "_"))
}

/// Recover the subnet encoded in a pool network name
pub fn subnet_for_network_name(name: &str) -> Option<String> {
    let encoded = name.strip_prefix(NETWORK_PREFIX)?;
    let parts: Vec<&str> = encoded.split('_').collect();
    if parts.len() != 5 || parts.iter().any(|p| p.parse::<u8>().is_err()) {
        return None;
    }
    Some(format!(
        "{}.{}.{}.{}/{}",
        parts[0], parts[1], parts[2], parts[3], parts[4]
    ))
}

/// Result of (re)initializing the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInit {
    /// Number of subnets available
    pub size: usize,
    /// Existing networks that encode a pool subnet and must be removed
    pub stale: Vec<String>,
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<String>,
    known: HashSet<String>,
}

/// FIFO pool of subnets
#[derive(Debug, Default)]
pub struct AddressPool {
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool filled from an expression
    pub fn from_expression(expr: &str) -> Result<Self> {
        let pool = Self::new();
        pool.init(expr, &[])?;
        Ok(pool)
    }

    /// Rebuild the pool from `expr`.
    ///
    /// `existing_networks` are the names of networks present in the runtime;
    /// the ones backed by a pool subnet are reported as stale so the caller
    /// can remove them after a restart.
    pub fn init(&self, expr: &str, existing_networks: &[String]) -> Result<PoolInit> {
        let subnets = parse_range_expression(expr)?;

        let mut state = self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire pool lock".to_string()))?;
        state.free.clear();
        state.known.clear();
        for subnet in subnets {
            if state.known.insert(subnet.clone()) {
                state.free.push_back(subnet);
            }
        }

        let stale = existing_networks
            .iter()
            .filter(|name| {
                subnet_for_network_name(name)
                    .map(|subnet| state.known.contains(&subnet))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        Ok(PoolInit {
            size: state.free.len(),
            stale,
        })
    }

    /// Take the oldest free subnet
    pub fn checkout(&self) -> Result<String> {
        let mut state = self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire pool lock".to_string()))?;
        state.free.pop_front().ok_or(FleetError::PoolExhausted)
    }

    /// Return a subnet. Subnets the pool does not own, or already holds, are ignored.
    pub fn release(&self, subnet: &str) -> Result<bool> {
        let mut state = self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire pool lock".to_string()))?;
        if !state.known.contains(subnet) || state.free.iter().any(|s| s == subnet) {
            tracing::debug!("Ignoring release of subnet {} not held by a workload", subnet);
            return Ok(false);
        }
        state.free.push_back(subnet.to_string());
        Ok(true)
    }

    /// Withdraw a specific subnet from the free list, e.g. one still in use by a
    /// network that could not be cleaned up
    pub fn reserve(&self, subnet: &str) -> Result<bool> {
        let mut state = self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire pool lock".to_string()))?;
        let before = state.free.len();
        state.free.retain(|s| s != subnet);
        Ok(state.free.len() != before)
    }

    /// Whether a subnet belongs to this pool
    pub fn owns(&self, subnet: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.known.contains(subnet))
            .unwrap_or(false)
    }

    pub fn available(&self) -> usize {
        self.state.lock().map(|s| s.free.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().map(|s| s.known.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_expand_single_range() {
        assert_eq!(
            parse_range_expression("172.[128-130].0.0/24").unwrap(),
            vec!["172.128.0.0/24", "172.129.0.0/24", "172.130.0.0/24"]
        );
    }

    #[test]
    fn test_expand_without_brackets() {
        assert_eq!(parse_range_expression("10.0.0.0/8").unwrap(), vec!["10.0.0.0/8"]);
    }

    #[test]
    fn test_expand_counts() {
        assert_eq!(parse_range_expression("172.[128-255].0.0/24").unwrap().len(), 128);
        assert_eq!(parse_range_expression("10.[0-1].[0-2].0/24").unwrap().len(), 6);
    }

    #[test]
    fn test_rejects_bad_ranges() {
        for expr in [
            "172.[130-128].0.0/24",
            "172.[0-256].0.0/24",
            "172.[1-2-3].0.0/24",
            "172.[a-3].0.0/24",
            "172.[1-3.0.0/24",
            "172.16.0.0",
            "172.16.0.0/33",
            "300.16.0.0/16",
        ] {
            assert!(
                matches!(parse_range_expression(expr), Err(FleetError::CidrParse { .. })),
                "{} should fail",
                expr
            );
        }
    }

    #[test]
    fn test_network_name_encoding() {
        let name = network_name_for("172.128.0.0/24");
        assert_eq!(name, "flotilla_172_128_0_0_24");
        assert_eq!(subnet_for_network_name(&name).unwrap(), "172.128.0.0/24");
        assert!(subnet_for_network_name("bridge").is_none());
        assert!(subnet_for_network_name("flotilla_web").is_none());
    }

    #[test]
    fn test_fifo_checkout_and_exhaustion() {
        let pool = AddressPool::from_expression("10.0.[0-1].0/24").unwrap();
        assert_eq!(pool.checkout().unwrap(), "10.0.0.0/24");
        assert_eq!(pool.checkout().unwrap(), "10.0.1.0/24");
        assert!(matches!(pool.checkout(), Err(FleetError::PoolExhausted)));

        assert!(pool.release("10.0.0.0/24").unwrap());
        assert_eq!(pool.checkout().unwrap(), "10.0.0.0/24");
    }

    #[test]
    fn test_release_is_not_duplicated() {
        let pool = AddressPool::from_expression("10.0.[0-1].0/24").unwrap();
        let subnet = pool.checkout().unwrap();
        assert!(pool.release(&subnet).unwrap());
        assert!(!pool.release(&subnet).unwrap());
        assert!(!pool.release("192.168.0.0/24").unwrap());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_reserve_withdraws_subnet() {
        let pool = AddressPool::from_expression("10.0.[0-1].0/24").unwrap();
        assert!(pool.reserve("10.0.0.0/24").unwrap());
        assert!(!pool.reserve("10.0.0.0/24").unwrap());
        assert_eq!(pool.checkout().unwrap(), "10.0.1.0/24");
        assert!(matches!(pool.checkout(), Err(FleetError::PoolExhausted)));
        assert!(pool.release("10.0.0.0/24").unwrap());
    }

    #[test]
    fn test_init_reports_stale_networks() {
        let pool = AddressPool::new();
        let existing = vec![
            "bridge".to_string(),
            "flotilla_10_0_1_0_24".to_string(),
            "flotilla_192_168_0_0_24".to_string(),
        ];
        let init = pool.init("10.0.[0-3].0/24", &existing).unwrap();
        assert_eq!(init.size, 4);
        assert_eq!(init.stale, vec!["flotilla_10_0_1_0_24".to_string()]);
    }

    #[test]
    fn test_interleaved_sequence_keeps_exclusivity() {
        let pool = AddressPool::from_expression("10.0.[0-4].0/24").unwrap();
        let mut held: Vec<String> = Vec::new();
        let mut seed: u64 = 0x2545_f491;

        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if (seed >> 33) % 2 == 0 || held.is_empty() {
                match pool.checkout() {
                    Ok(subnet) => {
                        assert!(!held.contains(&subnet));
                        held.push(subnet);
                    }
                    Err(FleetError::PoolExhausted) => assert_eq!(held.len(), 5),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            } else {
                let index = (seed >> 40) as usize % held.len();
                let subnet = held.swap_remove(index);
                assert!(pool.release(&subnet).unwrap());
            }
            assert!(held.len() <= 5);
            assert_eq!(held.len() + pool.available(), 5);
        }
    }

    #[test]
    fn test_concurrent_checkout_never_duplicates() {
        let pool = Arc::new(AddressPool::from_expression("10.1.[0-7].0/24").unwrap());
        let held = Arc::new(StdMutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let held = held.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(subnet) = pool.checkout() {
                            assert!(held.lock().unwrap().insert(subnet.clone()));
                            assert!(held.lock().unwrap().remove(&subnet));
                            pool.release(&subnet).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
    }
}
