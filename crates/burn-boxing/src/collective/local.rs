use alloc::sync::Arc;
use alloc::vec::Vec;
use burn_tensor::TensorData;
use core::time::Duration;
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex};

use super::{Collective, CollectiveError, CollectiveOp, sum_data};
use crate::BoxingConfig;
use crate::sharding::{DeviceGroup, Rank};

/// Identifies one collective call: the n-th call issued on a given group.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct RendezvousKey {
    group: Vec<Rank>,
    sequence: u64,
}

#[derive(Clone, Debug)]
enum Contribution {
    Buffer(TensorData),
    Parts(Vec<TensorData>),
}

/// A single collective in flight.
///
/// The slot lives as long as a depositor is still inside `exchange`. Once aborted it can no
/// longer complete: members waiting on it and members arriving at it fail.
#[derive(Debug)]
struct Rendezvous {
    op: CollectiveOp,
    contributions: Vec<Option<Contribution>>,
    depositors: usize,
    aborted: bool,
}

impl Rendezvous {
    fn new(op: CollectiveOp, members: usize) -> Self {
        Self {
            op,
            contributions: alloc::vec![None; members],
            depositors: 0,
            aborted: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.contributions.iter().all(Option::is_some)
    }
}

#[derive(Debug)]
struct Fabric {
    rendezvous: Mutex<HashMap<RendezvousKey, Rendezvous>>,
    arrived: Condvar,
    timeout: Duration,
}

/// An in-process cluster: one [`LocalCommunicator`] per rank, with threads standing in
/// for devices.
///
/// Every collective blocks until all members of its group issued the same call, or until the
/// configured timeout elapses.
#[derive(Clone, Debug)]
pub struct LocalCluster {
    world_size: usize,
    fabric: Arc<Fabric>,
}

impl LocalCluster {
    /// Creates a cluster of ranks `0..world_size`.
    pub fn new(world_size: usize, config: &BoxingConfig) -> Self {
        Self {
            world_size,
            fabric: Arc::new(Fabric {
                rendezvous: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
                timeout: config.collective_timeout,
            }),
        }
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// The communicator of `rank`.
    pub fn communicator(&self, rank: Rank) -> LocalCommunicator {
        LocalCommunicator {
            rank,
            fabric: self.fabric.clone(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<LocalCommunicator> {
        (0..self.world_size)
            .map(|rank| self.communicator(Rank(rank)))
            .collect()
    }

    /// Runs `participant` on one thread per rank and returns the results in rank order.
    ///
    /// A panic on any participant is resumed on the calling thread.
    pub fn launch<F, R>(&self, participant: F) -> Vec<R>
    where
        F: Fn(LocalCommunicator) -> R + Sync,
        R: Send,
    {
        std::thread::scope(|scope| {
            let participant = &participant;
            let handles = self
                .communicators()
                .into_iter()
                .map(|comm| scope.spawn(move || participant(comm)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    }
}

/// The view of a [`LocalCluster`] held by a single rank.
#[derive(Debug)]
pub struct LocalCommunicator {
    rank: Rank,
    fabric: Arc<Fabric>,
    sequences: Mutex<HashMap<Vec<Rank>, u64>>,
}

impl LocalCommunicator {
    fn next_key(&self, group: &DeviceGroup) -> Result<RendezvousKey, CollectiveError> {
        let mut sequences = self
            .sequences
            .lock()
            .map_err(|_| CollectiveError::Poisoned)?;
        let sequence = sequences.entry(group.ranks().to_vec()).or_insert(0);
        let key = RendezvousKey {
            group: group.ranks().to_vec(),
            sequence: *sequence,
        };
        *sequence += 1;
        Ok(key)
    }

    /// Deposits `contribution` and waits for the contributions of every member.
    fn exchange(
        &self,
        op: CollectiveOp,
        group: &DeviceGroup,
        contribution: Contribution,
    ) -> Result<Vec<Contribution>, CollectiveError> {
        let position = group
            .position(self.rank)
            .ok_or_else(|| CollectiveError::NotInGroup {
                rank: self.rank,
                group: group.ranks().to_vec(),
            })?;
        let key = self.next_key(group)?;
        log::trace!(
            "rank {} entering {op} #{} on {:?}",
            self.rank,
            key.sequence,
            key.group
        );

        let mut slots = self
            .fabric
            .rendezvous
            .lock()
            .map_err(|_| CollectiveError::Poisoned)?;
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Rendezvous::new(op, group.len()));
        if slot.aborted {
            return Err(CollectiveError::Aborted {
                op,
                group: key.group,
            });
        }
        if slot.op != op {
            log::warn!(
                "rank {} issued {op} while its peers issued {} on {:?}",
                self.rank,
                slot.op,
                key.group
            );
            slot.aborted = true;
            self.fabric.arrived.notify_all();
            return Err(CollectiveError::Mismatch {
                rank: self.rank,
                expected: slot.op,
                found: op,
                group: key.group,
            });
        }
        slot.contributions[position] = Some(contribution);
        slot.depositors += 1;
        self.fabric.arrived.notify_all();

        let (mut slots, _) = self
            .fabric
            .arrived
            .wait_timeout_while(slots, self.fabric.timeout, |slots| {
                slots
                    .get(&key)
                    .is_some_and(|slot| !slot.is_complete() && !slot.aborted)
            })
            .map_err(|_| CollectiveError::Poisoned)?;
        let slot = slots
            .get_mut(&key)
            .ok_or_else(|| CollectiveError::Payload("rendezvous vanished".into()))?;
        let outcome = if slot.is_complete() {
            slot.contributions
                .iter()
                .cloned()
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| CollectiveError::Payload("incomplete rendezvous".into()))
        } else if slot.aborted {
            Err(CollectiveError::Aborted {
                op,
                group: key.group.clone(),
            })
        } else {
            log::warn!(
                "rank {} timed out in {op} #{} on {:?}",
                self.rank,
                key.sequence,
                key.group
            );
            slot.aborted = true;
            self.fabric.arrived.notify_all();
            Err(CollectiveError::Timeout {
                op,
                group: key.group.clone(),
                waited: self.fabric.timeout,
            })
        };

        slot.depositors -= 1;
        if slot.depositors == 0 {
            slots.remove(&key);
        }
        outcome
    }
}

impl Collective for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn all_gather(
        &self,
        group: &DeviceGroup,
        local: TensorData,
    ) -> Result<Vec<TensorData>, CollectiveError> {
        self.exchange(CollectiveOp::AllGather, group, Contribution::Buffer(local))?
            .into_iter()
            .map(|contribution| match contribution {
                Contribution::Buffer(data) => Ok(data),
                Contribution::Parts(_) => Err(CollectiveError::Payload(
                    "all_gather received all_to_all parts".into(),
                )),
            })
            .collect()
    }

    fn all_to_all(
        &self,
        group: &DeviceGroup,
        parts: Vec<TensorData>,
    ) -> Result<Vec<TensorData>, CollectiveError> {
        if parts.len() != group.len() {
            return Err(CollectiveError::PartCount {
                expected: group.len(),
                got: parts.len(),
            });
        }
        let position = group
            .position(self.rank)
            .ok_or_else(|| CollectiveError::NotInGroup {
                rank: self.rank,
                group: group.ranks().to_vec(),
            })?;
        self.exchange(CollectiveOp::AllToAll, group, Contribution::Parts(parts))?
            .into_iter()
            .map(|contribution| match contribution {
                Contribution::Parts(mut parts) => Ok(parts.swap_remove(position)),
                Contribution::Buffer(_) => Err(CollectiveError::Payload(
                    "all_to_all received an all_gather buffer".into(),
                )),
            })
            .collect()
    }

    fn all_reduce_sum(
        &self,
        group: &DeviceGroup,
        local: TensorData,
    ) -> Result<TensorData, CollectiveError> {
        let gathered = self
            .exchange(CollectiveOp::AllReduceSum, group, Contribution::Buffer(local))?
            .into_iter()
            .map(|contribution| match contribution {
                Contribution::Buffer(data) => Ok(data),
                Contribution::Parts(_) => Err(CollectiveError::Payload(
                    "all_reduce_sum received all_to_all parts".into(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        sum_data(&gathered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(ranks: &[usize]) -> DeviceGroup {
        DeviceGroup::new(ranks.iter().copied().map(Rank).collect())
    }

    fn fast_cluster(world_size: usize) -> LocalCluster {
        LocalCluster::new(
            world_size,
            &BoxingConfig::default().with_collective_timeout(Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_all_gather_is_ordered_by_group() {
        let cluster = LocalCluster::new(3, &BoxingConfig::default());

        let results = cluster.launch(|comm| {
            let local = TensorData::new(vec![comm.rank().0 as f32], [1]);
            comm.all_gather(&group(&[2, 0, 1]), local).unwrap()
        });

        for gathered in results {
            let values = gathered
                .iter()
                .map(|data| data.to_vec::<f32>().unwrap()[0])
                .collect::<Vec<_>>();
            assert_eq!(values, vec![2.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn test_all_to_all_routes_parts() {
        let cluster = LocalCluster::new(2, &BoxingConfig::default());

        let results = cluster.launch(|comm| {
            let rank = comm.rank().0 as i64;
            let parts = (0..2)
                .map(|peer| TensorData::new(vec![rank * 10 + peer], [1]))
                .collect();
            comm.all_to_all(&group(&[0, 1]), parts).unwrap()
        });

        let received = results
            .iter()
            .map(|parts| {
                parts
                    .iter()
                    .map(|data| data.to_vec::<i64>().unwrap()[0])
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        assert_eq!(received, vec![vec![0, 10], vec![1, 11]]);
    }

    #[test]
    fn test_all_reduce_sum_over_subgroups() {
        let cluster = LocalCluster::new(4, &BoxingConfig::default());

        let results = cluster.launch(|comm| {
            let rank = comm.rank().0;
            let members = if rank % 2 == 0 { [0, 2] } else { [1, 3] };
            let local = TensorData::new(vec![rank as f32, 1.0], [2]);
            comm.all_reduce_sum(&group(&members), local)
                .unwrap()
                .to_vec::<f32>()
                .unwrap()
        });

        assert_eq!(results[0], vec![2.0, 2.0]);
        assert_eq!(results[1], vec![4.0, 2.0]);
        assert_eq!(results[2], results[0]);
        assert_eq!(results[3], results[1]);
    }

    #[test]
    fn test_missing_peer_times_out() {
        let cluster = fast_cluster(2);
        let comm = cluster.communicator(Rank(0));

        let err = comm
            .all_gather(&group(&[0, 1]), TensorData::new(vec![1.0f32], [1]))
            .unwrap_err();

        assert!(matches!(
            err,
            CollectiveError::Timeout {
                op: CollectiveOp::AllGather,
                ..
            }
        ));
    }

    #[test]
    fn test_late_peer_cannot_complete_an_abandoned_collective() {
        let cluster = fast_cluster(2);
        let early = cluster.communicator(Rank(0));
        let late = cluster.communicator(Rank(1));
        let members = group(&[0, 1]);

        let first = early.all_gather(&members, TensorData::new(vec![1.0f32], [1]));
        let second = late.all_gather(&members, TensorData::new(vec![2.0f32], [1]));

        assert!(matches!(first, Err(CollectiveError::Timeout { .. })));
        assert!(second.is_err());
        assert!(cluster.fabric.rendezvous.lock().unwrap().is_empty());
    }

    #[test]
    fn test_waiting_peer_is_released_by_a_diverging_one() {
        let cluster = LocalCluster::new(
            2,
            &BoxingConfig::default().with_collective_timeout(Duration::from_secs(5)),
        );
        let members = group(&[0, 1]);

        let results = cluster.launch(|comm| {
            let local = TensorData::new(vec![1.0f32], [1]);
            if comm.rank() == Rank(0) {
                comm.all_gather(&members, local).map(|_| ())
            } else {
                std::thread::sleep(Duration::from_millis(50));
                comm.all_reduce_sum(&members, local).map(|_| ())
            }
        });

        let mismatches = results
            .iter()
            .filter(|result| matches!(result, Err(CollectiveError::Mismatch { .. })))
            .count();
        let aborted = results
            .iter()
            .filter(|result| matches!(result, Err(CollectiveError::Aborted { .. })))
            .count();
        assert_eq!((mismatches, aborted), (1, 1));
        assert!(cluster.fabric.rendezvous.lock().unwrap().is_empty());
    }

    #[test]
    fn test_divergent_calls_are_reported() {
        let cluster = fast_cluster(2);

        let results = cluster.launch(|comm| {
            let local = TensorData::new(vec![1.0f32], [1]);
            if comm.rank() == Rank(0) {
                comm.all_gather(&group(&[0, 1]), local).map(|_| ())
            } else {
                comm.all_reduce_sum(&group(&[0, 1]), local).map(|_| ())
            }
        });

        assert!(results.iter().all(Result::is_err));
        assert!(
            results
                .iter()
                .any(|result| matches!(result, Err(CollectiveError::Mismatch { .. })))
        );
    }

    #[test]
    fn test_outsider_is_rejected() {
        let cluster = fast_cluster(3);
        let comm = cluster.communicator(Rank(2));

        let err = comm
            .all_reduce_sum(&group(&[0, 1]), TensorData::new(vec![1.0f32], [1]))
            .unwrap_err();

        assert!(matches!(err, CollectiveError::NotInGroup { rank: Rank(2), .. }));
    }
}
