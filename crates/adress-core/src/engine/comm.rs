//! In-process worker communicator.
//!
//! Each worker is a value inside a [`Collective`]. Code that must run on every worker is a
//! closure handed to one of its methods, and data only crosses workers as [`Envelope`]s routed
//! by [`exchange`], which acts as a barrier.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Rank(pub usize);

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub from: Rank,
    pub to: Rank,
    pub payload: M,
}

/// Messages one worker queues for delivery at the next exchange.
#[derive(Debug)]
pub struct Outbox<M> {
    rank: Rank,
    envelopes: Vec<Envelope<M>>,
}

impl<M> Outbox<M> {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            envelopes: Vec::new(),
        }
    }

    pub fn send(&mut self, to: Rank, payload: M) {
        self.envelopes.push(Envelope {
            from: self.rank,
            to,
            payload,
        });
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

/// One value per worker rank.
#[derive(Debug, Clone)]
pub struct Collective<T> {
    members: Vec<T>,
}

impl<T> Collective<T> {
    pub fn from_fn(size: usize, mut f: impl FnMut(Rank) -> T) -> Self {
        Self {
            members: (0..size).map(|i| f(Rank(i))).collect(),
        }
    }

    pub fn from_vec(members: Vec<T>) -> Self {
        Self { members }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn get(&self, rank: Rank) -> Option<&T> {
        self.members.get(rank.0)
    }

    pub fn get_mut(&mut self, rank: Rank) -> Option<&mut T> {
        self.members.get_mut(rank.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Rank, &T)> {
        self.members.iter().enumerate().map(|(i, m)| (Rank(i), m))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Rank, &mut T)> {
        self.members.iter_mut().enumerate().map(|(i, m)| (Rank(i), m))
    }

    /// All values in rank order.
    pub fn gather(self) -> Vec<T> {
        self.members
    }
}

impl<T: Send + Sync> Collective<T> {
    /// Runs `f` on every worker.
    pub fn for_each_mut<F>(&mut self, f: F)
    where
        F: Fn(Rank, &mut T) + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        let iterator = self.members.par_iter_mut();
        #[cfg(not(feature = "parallel"))]
        let iterator = self.members.iter_mut();

        iterator.enumerate().for_each(|(i, m)| f(Rank(i), m));
    }

    /// Runs `f` on every worker and collects the results in rank order.
    pub fn map<R, F>(&self, f: F) -> Collective<R>
    where
        R: Send,
        F: Fn(Rank, &T) -> R + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        let iterator = self.members.par_iter();
        #[cfg(not(feature = "parallel"))]
        let iterator = self.members.iter();

        Collective {
            members: iterator.enumerate().map(|(i, m)| f(Rank(i), m)).collect(),
        }
    }

    /// Runs `f` on every worker with mutable access and collects the results in rank order.
    pub fn map_mut<R, F>(&mut self, f: F) -> Collective<R>
    where
        R: Send,
        F: Fn(Rank, &mut T) -> R + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        let iterator = self.members.par_iter_mut();
        #[cfg(not(feature = "parallel"))]
        let iterator = self.members.iter_mut();

        Collective {
            members: iterator.enumerate().map(|(i, m)| f(Rank(i), m)).collect(),
        }
    }

    /// Runs `f` on every worker. On failure returns the error of the lowest failing rank.
    pub fn try_map_mut<R, E, F>(&mut self, f: F) -> Result<Collective<R>, E>
    where
        R: Send,
        E: Send,
        F: Fn(Rank, &mut T) -> Result<R, E> + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        let iterator = self.members.par_iter_mut();
        #[cfg(not(feature = "parallel"))]
        let iterator = self.members.iter_mut();

        let results: Vec<Result<R, E>> =
            iterator.enumerate().map(|(i, m)| f(Rank(i), m)).collect();
        Ok(Collective {
            members: results.into_iter().collect::<Result<Vec<_>, _>>()?,
        })
    }

    /// Runs `f` on every worker together with the same rank's value of `other`.
    pub fn try_zip_map_mut<U, R, E, F>(
        &mut self,
        other: &Collective<U>,
        f: F,
    ) -> Result<Collective<R>, E>
    where
        U: Send + Sync,
        R: Send,
        E: Send,
        F: Fn(Rank, &mut T, &U) -> Result<R, E> + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        let iterator = self.members.par_iter_mut().zip(other.members.par_iter());
        #[cfg(not(feature = "parallel"))]
        let iterator = self.members.iter_mut().zip(other.members.iter());

        let results: Vec<Result<R, E>> = iterator
            .enumerate()
            .map(|(i, (m, o))| f(Rank(i), m, o))
            .collect();
        Ok(Collective {
            members: results.into_iter().collect::<Result<Vec<_>, _>>()?,
        })
    }

    /// Maps every worker's value and folds the results in rank order.
    pub fn all_reduce<R, M, G>(&self, map: M, init: R, reduce: G) -> R
    where
        R: Send,
        M: Fn(Rank, &T) -> R + Send + Sync,
        G: Fn(R, R) -> R,
    {
        self.map(map).members.into_iter().fold(init, reduce)
    }

    /// Returns `true` if `predicate` holds on any worker.
    pub fn any<P>(&self, predicate: P) -> bool
    where
        P: Fn(Rank, &T) -> bool + Send + Sync,
    {
        self.map(predicate).members.into_iter().any(|hit| hit)
    }
}

/// Routes every queued envelope to its destination.
///
/// Inboxes are ordered by sender rank, then by send order, so delivery is deterministic.
/// Envelopes addressed to a rank outside the collective are dropped with a warning.
pub fn exchange<M>(outboxes: Collective<Outbox<M>>) -> Collective<Vec<Envelope<M>>> {
    let size = outboxes.size();
    let mut inboxes: Vec<Vec<Envelope<M>>> = (0..size).map(|_| Vec::new()).collect();
    for outbox in outboxes.gather() {
        for envelope in outbox.envelopes {
            match inboxes.get_mut(envelope.to.0) {
                Some(inbox) => inbox.push(envelope),
                None => tracing::warn!(
                    from = envelope.from.0,
                    to = envelope.to.0,
                    "Dropping message addressed to a nonexistent worker"
                ),
            }
        }
    }
    Collective::from_vec(inboxes)
}
