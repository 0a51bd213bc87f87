//! Kademlia routing table with k-buckets

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::key::{DhtId, ID_BITS};

/// Failed RPCs after which a contact is evicted
const MAX_FAILED_RPCS: u32 = 3;

/// A reachable DHT node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: DhtId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: DhtId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    contact: Contact,
    failed_rpcs: u32,
}

#[derive(Debug)]
struct Bucket {
    /// Least recently seen first
    entries: VecDeque<Entry>,
    last_accessed: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_accessed: Instant::now(),
        }
    }
}

/// Outcome of offering a contact to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    Added,
    Refreshed,
    /// Bucket full; the least recently seen contact should be pinged
    BucketFull { oldest: Contact },
    Ignored,
}

pub struct RoutingTable {
    own_id: DhtId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: DhtId, k: usize) -> Self {
        Self {
            own_id,
            k,
            buckets: (0..ID_BITS).map(|_| Bucket::new()).collect(),
        }
    }

    /// Add or refresh a contact
    pub fn add_contact(&mut self, contact: Contact) -> Insertion {
        let Some(index) = self.own_id.bucket_index(&contact.id) else {
            return Insertion::Ignored;
        };
        let k = self.k;
        let bucket = &mut self.buckets[index];
        bucket.last_accessed = Instant::now();

        if let Some(pos) = bucket.entries.iter().position(|e| e.contact.id == contact.id) {
            bucket.entries.remove(pos);
            bucket.entries.push_back(Entry {
                contact,
                failed_rpcs: 0,
            });
            return Insertion::Refreshed;
        }

        if bucket.entries.len() < k {
            bucket.entries.push_back(Entry {
                contact,
                failed_rpcs: 0,
            });
            return Insertion::Added;
        }

        // replace a contact that keeps failing
        if let Some(pos) = bucket
            .entries
            .iter()
            .position(|e| e.failed_rpcs >= MAX_FAILED_RPCS)
        {
            bucket.entries.remove(pos);
            bucket.entries.push_back(Entry {
                contact,
                failed_rpcs: 0,
            });
            return Insertion::Added;
        }

        match bucket.entries.front() {
            Some(oldest) => Insertion::BucketFull {
                oldest: oldest.contact.clone(),
            },
            None => Insertion::Ignored,
        }
    }

    /// Count a failed RPC, evicting the contact once it fails too often
    pub fn record_failure(&mut self, id: &DhtId) {
        let Some(index) = self.own_id.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.entries.iter().position(|e| e.contact.id == *id) {
            bucket.entries[pos].failed_rpcs += 1;
            if bucket.entries[pos].failed_rpcs >= MAX_FAILED_RPCS {
                bucket.entries.remove(pos);
            }
        }
    }

    pub fn remove_contact(&mut self, id: &DhtId) {
        if let Some(index) = self.own_id.bucket_index(id) {
            self.buckets[index].entries.retain(|e| e.contact.id != *id);
        }
    }

    /// Up to `count` known contacts closest to `target`
    pub fn find_close_nodes(
        &self,
        target: &DhtId,
        count: usize,
        exclude: Option<&DhtId>,
    ) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| Some(&e.contact.id) != exclude)
            .map(|e| e.contact.clone())
            .collect();
        contacts.sort_by_key(|c| c.id.distance(target));
        contacts.truncate(count);
        contacts
    }

    /// Mark the bucket covering `target` as recently used
    pub fn touch(&mut self, target: &DhtId) {
        if let Some(index) = self.own_id.bucket_index(target) {
            self.buckets[index].last_accessed = Instant::now();
        }
    }

    /// Indexes of non-empty buckets not accessed within `refresh`
    pub fn stale_buckets(&self, refresh: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.last_accessed.elapsed() >= refresh)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_refreshed(&mut self, index: usize) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.last_accessed = Instant::now();
        }
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.contact.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
