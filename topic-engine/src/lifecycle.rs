/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Compare-and-set lifecycle state machines.

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// A lifecycle enum that can live in a [`StateCell`].
pub trait LifecycleState: Copy + Eq + Debug + Send + Sync + 'static {
    fn to_u8(self) -> u8;

    fn from_u8(value: u8) -> Self;

    /// Whether the machine may move from `self` to `next`. Staying put is always
    /// allowed except where a state chooses otherwise.
    fn can_transition(self, next: Self) -> bool;
}

/// Atomic holder of a [`LifecycleState`]. Illegal transitions are rejected, never
/// applied.
pub struct StateCell<S: LifecycleState> {
    value: AtomicU8,
    _state: PhantomData<S>,
}

impl<S: LifecycleState> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            value: AtomicU8::new(initial.to_u8()),
            _state: PhantomData,
        }
    }

    pub fn get(&self) -> S {
        S::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Moves to `next` only if the current state is `expected` and the transition is
    /// legal.
    pub fn compare_and_set(&self, expected: S, next: S) -> bool {
        if !expected.can_transition(next) {
            return false;
        }
        self.value
            .compare_exchange(
                expected.to_u8(),
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `next` from whatever the current state is, returning the previous
    /// state, or `None` when the transition is illegal.
    pub fn transition(&self, next: S) -> Option<S> {
        let mut current = self.get();
        loop {
            if !current.can_transition(next) {
                return None;
            }
            match self.value.compare_exchange(
                current.to_u8(),
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = S::from_u8(actual),
            }
        }
    }
}

impl<S: LifecycleState> Debug for StateCell<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateCell({:?})", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::{LifecycleState, StateCell};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Door {
        Open,
        Shut,
        Bricked,
    }

    impl LifecycleState for Door {
        fn to_u8(self) -> u8 {
            self as u8
        }

        fn from_u8(value: u8) -> Self {
            match value {
                0 => Door::Open,
                1 => Door::Shut,
                _ => Door::Bricked,
            }
        }

        fn can_transition(self, next: Self) -> bool {
            self != Door::Bricked || next == Door::Bricked
        }
    }

    #[test]
    fn compare_and_set_requires_expected_state() {
        let cell = StateCell::new(Door::Open);

        assert!(!cell.compare_and_set(Door::Shut, Door::Open));
        assert!(cell.compare_and_set(Door::Open, Door::Shut));
        assert_eq!(cell.get(), Door::Shut);
    }

    #[test]
    fn terminal_state_rejects_transitions() {
        let cell = StateCell::new(Door::Open);

        assert_eq!(cell.transition(Door::Bricked), Some(Door::Open));
        assert_eq!(cell.transition(Door::Open), None);
        assert!(!cell.compare_and_set(Door::Bricked, Door::Shut));
        assert_eq!(cell.get(), Door::Bricked);
    }
}
