/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! Channel subscription bookkeeping for the Message Director.
//!
//! Point subscriptions are refcounted through a [`MultiMap`]: the same
//! channel may be given to us by more than one subscriber (e.g. two
//! clients interested in the same State Server), so the uplink is only
//! notified the first time a channel gains a local subscriber, and
//! only once the last local subscriber drops it. Range subscriptions
//! are kept as a flat `Vec` checked linearly; a running cluster rarely
//! holds more than one open range per DBSS shard at a time.

use crate::subscriber::SubscriberRef;
use donet_core::globals::Channel;
use multimap::MultiMap;
use std::collections::HashSet;
use std::ops::Range;

#[derive(Default)]
pub struct ChannelMap {
    subscriptions: MultiMap<Channel, SubscriberRef>,
    range_subscriptions: Vec<(Range<Channel>, SubscriberRef)>,
}

impl ChannelMap {
    /// Collects every subscriber listening on `channel`, whether via a
    /// point subscription or one that covers it via a range.
    fn subscribers_of(&self, channel: Channel, out: &mut HashSet<SubscriberRef>) {
        if let Some(subs) = self.subscriptions.get_vec(&channel) {
            out.extend(subs.iter().cloned());
        }
        for (range, sub) in self.range_subscriptions.iter() {
            if range.contains(&channel) {
                out.insert(sub.clone());
            }
        }
    }
}

pub trait ChannelCoordinator {
    /// Struct implementing this trait must have a [`ChannelMap`] in memory.
    fn get_channel_map(&mut self) -> &mut ChannelMap;

    async fn on_add_channel(&mut self, channel: Channel);
    async fn on_remove_channel(&mut self, channel: Channel);
    async fn on_add_range(&mut self, range: Range<Channel>);
    async fn on_remove_range(&mut self, range: Range<Channel>);

    /// Adds a single channel to the subscriber's subscribed channels map.
    /// Notifies the uplink only the first time this channel gains a
    /// local subscriber.
    async fn subscribe_channel(&mut self, sub: SubscriberRef, chan: Channel) {
        {
            let mut locked_sub = sub.lock().await;
            if locked_sub.subscribed_channels.contains(&chan) {
                return;
            }
            locked_sub.subscribed_channels.insert(chan);
        }

        let map = self.get_channel_map();
        let is_new_channel = !map.subscriptions.contains_key(&chan);
        map.subscriptions.insert(chan, sub);

        if is_new_channel {
            self.on_add_channel(chan).await;
        }
    }

    /// Removes the given channel from the subscribed channels map.
    /// Notifies the uplink only once the last local subscriber of this
    /// channel has been removed.
    async fn unsubscribe_channel(&mut self, sub: SubscriberRef, chan: Channel) {
        {
            let mut locked_sub = sub.lock().await;
            if !locked_sub.subscribed_channels.remove(&chan) {
                return;
            }
        }

        let became_empty = self.remove_subscriber(sub, chan).await;

        if became_empty {
            self.on_remove_channel(chan).await;
        }
    }

    /// Adds an object to be subscribed to a range of channels. The range is inclusive.
    async fn subscribe_range(&mut self, sub: SubscriberRef, min: Channel, max: Channel) {
        let range = min..(max.saturating_add(1));

        {
            let mut locked_sub = sub.lock().await;
            if locked_sub.subscribed_ranges.contains(&range) {
                return;
            }
            locked_sub.subscribed_ranges.insert(range.clone());
        }

        self.get_channel_map().range_subscriptions.push((range.clone(), sub));
        self.on_add_range(range).await;
    }

    /// Performs the reverse of the subscribe_range() method.
    async fn unsubscribe_range(&mut self, sub: SubscriberRef, min: Channel, max: Channel) {
        let range = min..(max.saturating_add(1));

        {
            let mut locked_sub = sub.lock().await;
            if !locked_sub.subscribed_ranges.remove(&range) {
                return;
            }
        }

        let map = self.get_channel_map();
        map.range_subscriptions.retain(|(r, s)| !(*r == range && *s == sub));

        self.on_remove_range(range).await;
    }

    /// Removes all channel and range subscriptions from the subscriber.
    /// Called when a subscriber (TCP connection) disconnects.
    async fn unsubscribe_all(&mut self, sub: SubscriberRef) {
        let (channels, ranges) = {
            let locked_sub = sub.lock().await;
            (
                locked_sub.subscribed_channels.iter().cloned().collect::<Vec<_>>(),
                locked_sub.subscribed_ranges.iter().cloned().collect::<Vec<_>>(),
            )
        };

        for chan in channels {
            self.unsubscribe_channel(sub.clone(), chan).await;
        }
        for range in ranges {
            self.unsubscribe_range(sub.clone(), range.start, range.end.saturating_sub(1))
                .await;
        }
    }

    /// Removes the given subscriber from the MultiMap for a given channel.
    ///
    /// Returns true only if the channel has no remaining point
    /// subscribers after the removal.
    async fn remove_subscriber(&mut self, sub: SubscriberRef, chan: Channel) -> bool {
        let map: &mut ChannelMap = self.get_channel_map();

        if let Some(subs) = map.subscriptions.get_vec_mut(&chan) {
            subs.retain(|s| *s != sub);
            if subs.is_empty() {
                map.subscriptions.remove(&chan);
            }
        }
        !map.subscriptions.contains_key(&chan)
    }

    /// Checks if a given object has a subscription on a channel,
    /// either directly or via a range subscription.
    async fn is_subscribed(&self, sub: SubscriberRef, chan: Channel) -> bool {
        let locked_sub = sub.lock().await;

        if locked_sub.subscribed_channels.contains(&chan) {
            return true;
        }
        locked_sub.subscribed_ranges.iter().any(|r| r.contains(&chan))
    }

    /// Performs the same check as is_subscribed(), but for an array of channels.
    /// Returns true if every given channel has at least one subscriber among `subs`.
    async fn are_subscribed(&self, subs: &[SubscriberRef], chans: &[Channel]) -> bool {
        for chan in chans {
            let mut found = false;
            for sub in subs {
                if self.is_subscribed(sub.clone(), *chan).await {
                    found = true;
                    break;
                }
            }
            if !found {
                return false;
            }
        }
        true
    }

    /// Collects every subscriber listening on any of the given channels.
    fn lookup_channels(&mut self, chans: Vec<Channel>, out: &mut HashSet<SubscriberRef>) {
        let map = self.get_channel_map();
        for chan in chans {
            map.subscribers_of(chan, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::Subscriber;
    use donet_network::Client;
    use std::net::SocketAddr;

    fn dummy_subscriber(port: u16) -> SubscriberRef {
        let remote: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        Subscriber::new_detached(remote).into()
    }

    struct TestCoordinator {
        map: ChannelMap,
        upstream_adds: Vec<Channel>,
        upstream_removes: Vec<Channel>,
    }

    impl ChannelCoordinator for TestCoordinator {
        fn get_channel_map(&mut self) -> &mut ChannelMap {
            &mut self.map
        }
        async fn on_add_channel(&mut self, channel: Channel) {
            self.upstream_adds.push(channel);
        }
        async fn on_remove_channel(&mut self, channel: Channel) {
            self.upstream_removes.push(channel);
        }
        async fn on_add_range(&mut self, _range: Range<Channel>) {}
        async fn on_remove_range(&mut self, _range: Range<Channel>) {}
    }

    fn new_coordinator() -> TestCoordinator {
        TestCoordinator {
            map: ChannelMap::default(),
            upstream_adds: vec![],
            upstream_removes: vec![],
        }
    }

    #[tokio::test]
    async fn channel_becomes_empty_after_last_unsubscribe() {
        let mut coord = new_coordinator();
        let sub_a = dummy_subscriber(1);
        let sub_b = dummy_subscriber(2);

        coord.subscribe_channel(sub_a.clone(), 42).await;
        coord.subscribe_channel(sub_b.clone(), 42).await;
        // second subscriber of an already-subscribed channel should not re-notify upstream
        assert_eq!(coord.upstream_adds, vec![42]);

        coord.unsubscribe_channel(sub_a, 42).await;
        assert!(coord.upstream_removes.is_empty());

        coord.unsubscribe_channel(sub_b, 42).await;
        assert_eq!(coord.upstream_removes, vec![42]);
    }

    #[tokio::test]
    async fn range_subscription_covers_contained_channel() {
        let mut coord = new_coordinator();
        let sub = dummy_subscriber(3);

        coord.subscribe_range(sub.clone(), 1000, 2000).await;
        assert!(coord.is_subscribed(sub.clone(), 1500).await);
        assert!(!coord.is_subscribed(sub.clone(), 2001).await);

        let mut out: HashSet<SubscriberRef> = HashSet::default();
        coord.lookup_channels(vec![1500], &mut out);
        assert_eq!(out.len(), 1);

        coord.unsubscribe_range(sub.clone(), 1000, 2000).await;
        assert!(!coord.is_subscribed(sub, 1500).await);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_point_and_range_subscriptions() {
        let mut coord = new_coordinator();
        let sub = dummy_subscriber(4);

        coord.subscribe_channel(sub.clone(), 7).await;
        coord.subscribe_range(sub.clone(), 100, 200).await;

        coord.unsubscribe_all(sub.clone()).await;

        assert!(!coord.is_subscribed(sub.clone(), 7).await);
        assert!(!coord.is_subscribed(sub, 150).await);
    }

    #[tokio::test]
    async fn are_subscribed_requires_all_channels_covered() {
        let mut coord = new_coordinator();
        let sub = dummy_subscriber(5);

        coord.subscribe_channel(sub.clone(), 1).await;
        coord.subscribe_channel(sub.clone(), 2).await;

        let subs = [sub];
        assert!(coord.are_subscribed(&subs, &[1, 2]).await);
        assert!(!coord.are_subscribed(&subs, &[1, 2, 3]).await);
    }
}
