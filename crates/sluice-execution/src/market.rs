use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::id::TaskGroupId;
use crate::plan::Location;

const ALLOCATION_LEASE: Duration = Duration::from_secs(300);

/// A lease of a specific worker location to one task group.
/// The lease expires unless renewed; renewal is a market concern and
/// happens when the supply is returned.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub location: Location,
    pub leased_until: Instant,
}

#[derive(Debug)]
pub struct Supply {
    pub allocation: Allocation,
}

/// What a placement request asks for. The market currently matches on
/// availability alone; the requirement identifies the demand in logs.
#[derive(Debug, Clone)]
pub struct DemandRequirement {
    pub task_group: TaskGroupId,
}

struct PendingDemand {
    bid: f64,
    sequence: u64,
    requirement: DemandRequirement,
    sender: oneshot::Sender<Supply>,
}

impl PartialEq for PendingDemand {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingDemand {}

impl PartialOrd for PendingDemand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingDemand {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest bid first; FIFO among equal bids.
        self.bid
            .total_cmp(&other.bid)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct MarketState {
    sequence: u64,
    supplies: VecDeque<Supply>,
    demands: BinaryHeap<PendingDemand>,
}

/// Matches placement demands to worker supplies by bid.
/// Each demand is answered asynchronously with exactly one supply on its
/// one-shot channel once a worker is available.
#[derive(Default)]
pub struct SupplyMarket {
    state: Mutex<MarketState>,
}

impl SupplyMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a worker location as available capacity.
    pub fn add_supply(&self, location: Location) {
        let mut state = self.state.lock().unwrap();
        state.supplies.push_back(Supply {
            allocation: Allocation {
                location,
                leased_until: Instant::now() + ALLOCATION_LEASE,
            },
        });
        Self::match_pending(&mut state);
    }

    /// Register a placement demand. The returned channel yields exactly one
    /// supply when the demand is matched.
    pub fn add_demand(&self, requirement: DemandRequirement, bid: f64) -> oneshot::Receiver<Supply> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        let sequence = state.sequence;
        state.demands.push(PendingDemand {
            bid,
            sequence,
            requirement,
            sender: tx,
        });
        Self::match_pending(&mut state);
        rx
    }

    /// Release a reservation back to the market once the task group has
    /// terminated. The lease is renewed before the supply is reused.
    pub fn return_supply(&self, mut supply: Supply) {
        supply.allocation.leased_until = Instant::now() + ALLOCATION_LEASE;
        let mut state = self.state.lock().unwrap();
        state.supplies.push_back(supply);
        Self::match_pending(&mut state);
    }

    fn match_pending(state: &mut MarketState) {
        while !state.supplies.is_empty() {
            let Some(demand) = state.demands.pop() else {
                return;
            };
            let Some(supply) = state.supplies.pop_front() else {
                return;
            };
            debug!(
                "matched task group {} to {:?} with bid {}",
                demand.requirement.task_group, supply.allocation.location, demand.bid
            );
            if let Err(supply) = demand.sender.send(supply) {
                // The demand was abandoned; keep the supply available.
                state.supplies.push_front(supply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(port: u32) -> Location {
        Location {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    fn requirement(id: usize) -> DemandRequirement {
        DemandRequirement {
            task_group: TaskGroupId::from(id),
        }
    }

    #[tokio::test]
    async fn test_demand_before_supply() {
        let market = SupplyMarket::new();
        let rx = market.add_demand(requirement(0), 1.0);
        market.add_supply(worker(7001));
        let supply = rx.await.unwrap();
        assert_eq!(supply.allocation.location.port, 7001);
    }

    #[tokio::test]
    async fn test_highest_bid_wins() {
        let market = SupplyMarket::new();
        let low = market.add_demand(requirement(0), 1.0);
        let high = market.add_demand(requirement(1), 5.0);
        market.add_supply(worker(7001));
        let supply = high.await.unwrap();
        assert_eq!(supply.allocation.location.port, 7001);
        market.add_supply(worker(7002));
        assert_eq!(low.await.unwrap().allocation.location.port, 7002);
    }

    #[tokio::test]
    async fn test_return_supply_matches_next_demand() {
        let market = SupplyMarket::new();
        market.add_supply(worker(7001));
        let first = market.add_demand(requirement(0), 1.0).await.unwrap();
        let second = market.add_demand(requirement(1), 1.0);
        market.return_supply(first);
        assert_eq!(second.await.unwrap().allocation.location.port, 7001);
    }

    #[tokio::test]
    async fn test_abandoned_demand_keeps_supply() {
        let market = SupplyMarket::new();
        let rx = market.add_demand(requirement(0), 1.0);
        drop(rx);
        market.add_supply(worker(7001));
        let supply = market.add_demand(requirement(1), 1.0).await.unwrap();
        assert_eq!(supply.allocation.location.port, 7001);
    }
}
