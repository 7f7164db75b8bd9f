//! In-memory primary set plus subject/predicate/object indices.
//!
//! The index is a plain data structure; [`crate::store::TripleStore`] owns the
//! lock that keeps the primary set and the three indices consistent.

use std::collections::{HashMap, HashSet};

use crate::triple::{Triple, TripleId, TriplePattern};

/// Primary triple set with three secondary indices.
#[derive(Debug, Default)]
pub struct TripleIndex {
    triples: HashMap<TripleId, Triple>,
    by_subject: HashMap<String, HashSet<TripleId>>,
    by_predicate: HashMap<String, HashSet<TripleId>>,
    by_object: HashMap<String, HashSet<TripleId>>,
    bytes: u64,
}

impl TripleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under `id`. Returns `false` if the id was already present.
    pub fn insert(&mut self, id: TripleId, triple: Triple) -> bool {
        if self.triples.contains_key(&id) {
            return false;
        }
        self.by_subject
            .entry(triple.subject.clone())
            .or_default()
            .insert(id);
        self.by_predicate
            .entry(triple.predicate.clone())
            .or_default()
            .insert(id);
        self.by_object
            .entry(triple.object.clone())
            .or_default()
            .insert(id);
        self.bytes += triple.stored_size();
        self.triples.insert(id, triple);
        true
    }

    pub fn contains(&self, id: &TripleId) -> bool {
        self.triples.contains_key(id)
    }

    pub fn get(&self, id: &TripleId) -> Option<&Triple> {
        self.triples.get(id)
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Sum of [`Triple::stored_size`] over the primary set.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn ids(&self) -> Vec<TripleId> {
        self.triples.keys().copied().collect()
    }

    /// Every triple, in a stable order.
    pub fn all(&self) -> Vec<Triple> {
        sorted(self.triples.values().cloned().collect())
    }

    /// Intersect the index hits of every bound position.
    pub fn query(&self, pattern: &TriplePattern) -> Vec<Triple> {
        let mut sets: Vec<&HashSet<TripleId>> = Vec::with_capacity(3);
        for (index, key) in [
            (&self.by_subject, &pattern.subject),
            (&self.by_predicate, &pattern.predicate),
            (&self.by_object, &pattern.object),
        ] {
            if let Some(key) = key {
                match index.get(key) {
                    Some(set) => sets.push(set),
                    None => return Vec::new(),
                }
            }
        }

        sets.sort_by_key(|s| s.len());
        let Some((smallest, rest)) = sets.split_first() else {
            return self.all();
        };
        let hits = smallest
            .iter()
            .filter(|id| rest.iter().all(|s| s.contains(*id)))
            .filter_map(|id| self.triples.get(id))
            .cloned()
            .collect();
        sorted(hits)
    }
}

fn sorted(mut triples: Vec<Triple>) -> Vec<Triple> {
    triples.sort_by(|a, b| {
        (&a.subject, &a.predicate, &a.object, &a.signer)
            .cmp(&(&b.subject, &b.predicate, &b.object, &b.signer))
    });
    triples
}
