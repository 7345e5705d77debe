//! Default allocation: manual requests first, then round-robin.

use super::{AllocationInput, ChannelAllocation, ChannelAllocationStrategy};
use crate::model::SubscriberId;
use crate::observability::{events, fields};
use tracing::{debug, trace, warn, Level};

const COMPONENT: &str = "channel_allocation";

#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleChannelAllocationStrategy;

impl ChannelAllocationStrategy for SimpleChannelAllocationStrategy {
    fn allocate(&self, input: &AllocationInput<'_>) -> ChannelAllocation {
        let removed = self.cleanup(input.subscribers, input.membership);
        if !removed.is_empty() {
            debug!(
                event = events::ALLOCATION_CLEANUP,
                component = COMPONENT,
                removed = removed.len(),
                "removed subscribers of departed members"
            );
        }

        let mut channels: Vec<Option<SubscriberId>> = vec![None; input.channel_count];
        let mut automatic: Vec<SubscriberId> = Vec::new();

        for subscriber in input.subscribers.difference(&removed) {
            let Some(requested) = input.manual.get(subscriber) else {
                automatic.push(*subscriber);
                continue;
            };
            for &channel in requested {
                match channels.get_mut(channel) {
                    Some(slot) if slot.is_none() => *slot = Some(*subscriber),
                    _ => warn!(
                        event = events::ALLOCATION_MANUAL_IGNORED,
                        component = COMPONENT,
                        subscriber_id = %subscriber,
                        channel,
                        channel_count = input.channel_count,
                        "ignoring manual channel request that is out of range or already taken"
                    ),
                }
            }
        }

        if !automatic.is_empty() {
            let unallocated = channels
                .iter_mut()
                .filter(|slot| slot.is_none())
                .enumerate();
            for (index, slot) in unallocated {
                *slot = Some(automatic[index % automatic.len()]);
            }
        }

        let allocation = ChannelAllocation { channels, removed };
        if tracing::enabled!(Level::TRACE) {
            for (subscriber, owned) in allocation.by_subscriber() {
                trace!(
                    component = COMPONENT,
                    subscriber_id = %subscriber,
                    channels = fields::format_channels(&owned),
                    "allocated channels"
                );
            }
        }
        allocation
    }
}
