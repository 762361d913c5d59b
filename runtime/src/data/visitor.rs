//! Data visitors: non-blocking, typed access to per-channel buffers.
//!
//! A visitor polls one driving channel plus up to three secondary
//! channels on behalf of a routine. The driving channel is consumed
//! message by message; secondary channels contribute their latest
//! observed message, which must exist for a fetch to succeed. Secondary
//! checks run before the driving pop so a miss never loses data.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Bounded per-channel message buffer shared between the transport side
/// (push) and the visitor side (fetch).
pub struct ChannelBuffer<T> {
    channel_id: u64,
    inner: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T> Clone for ChannelBuffer<T> {
    fn clone(&self) -> Self {
        ChannelBuffer {
            channel_id: self.channel_id,
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> ChannelBuffer<T> {
    pub fn new(channel_id: u64, capacity: usize) -> ChannelBuffer<T> {
        ChannelBuffer {
            channel_id,
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Deposit a message, discarding the oldest one when full.
    pub fn push(&self, value: T) {
        let mut queue = self.inner.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(value);
    }

    /// Consume the oldest unread message.
    pub fn try_fetch(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Latest observed message, left in place.
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().back().cloned()
    }
}

/// Type-erased view of a visitor: the channels it watches. Used by the
/// scheduler to register wake-up notifiers.
pub trait DataVisitorBase: Send + Sync {
    fn channel_ids(&self) -> Vec<u64>;
}

/// A typed visitor as consumed by the routine factory.
pub trait DataVisitor: DataVisitorBase {
    type Fetched: Send + 'static;

    /// Non-blocking fetch of all inputs; `None` when any input has
    /// nothing to offer.
    fn try_fetch(&self) -> Option<Self::Fetched>;
}

/// Visitor over a single channel.
pub struct DataVisitor1<M0> {
    ch0: ChannelBuffer<M0>,
}

impl<M0: Clone + Send + 'static> DataVisitor1<M0> {
    pub fn new(ch0: ChannelBuffer<M0>) -> DataVisitor1<M0> {
        DataVisitor1 { ch0 }
    }
}

impl<M0: Clone + Send + 'static> DataVisitorBase for DataVisitor1<M0> {
    fn channel_ids(&self) -> Vec<u64> {
        vec![self.ch0.channel_id()]
    }
}

impl<M0: Clone + Send + 'static> DataVisitor for DataVisitor1<M0> {
    type Fetched = M0;

    fn try_fetch(&self) -> Option<M0> {
        self.ch0.try_fetch()
    }
}

/// Visitor fusing a driving channel with one secondary channel.
pub struct DataVisitor2<M0, M1> {
    ch0: ChannelBuffer<M0>,
    ch1: ChannelBuffer<M1>,
}

impl<M0, M1> DataVisitor2<M0, M1>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
{
    pub fn new(ch0: ChannelBuffer<M0>, ch1: ChannelBuffer<M1>) -> DataVisitor2<M0, M1> {
        DataVisitor2 { ch0, ch1 }
    }
}

impl<M0, M1> DataVisitorBase for DataVisitor2<M0, M1>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
{
    fn channel_ids(&self) -> Vec<u64> {
        vec![self.ch0.channel_id(), self.ch1.channel_id()]
    }
}

impl<M0, M1> DataVisitor for DataVisitor2<M0, M1>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
{
    type Fetched = (M0, M1);

    fn try_fetch(&self) -> Option<(M0, M1)> {
        let m1 = self.ch1.latest()?;
        let m0 = self.ch0.try_fetch()?;
        Some((m0, m1))
    }
}

/// Visitor fusing a driving channel with two secondary channels.
pub struct DataVisitor3<M0, M1, M2> {
    ch0: ChannelBuffer<M0>,
    ch1: ChannelBuffer<M1>,
    ch2: ChannelBuffer<M2>,
}

impl<M0, M1, M2> DataVisitor3<M0, M1, M2>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
    M2: Clone + Send + 'static,
{
    pub fn new(
        ch0: ChannelBuffer<M0>,
        ch1: ChannelBuffer<M1>,
        ch2: ChannelBuffer<M2>,
    ) -> DataVisitor3<M0, M1, M2> {
        DataVisitor3 { ch0, ch1, ch2 }
    }
}

impl<M0, M1, M2> DataVisitorBase for DataVisitor3<M0, M1, M2>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
    M2: Clone + Send + 'static,
{
    fn channel_ids(&self) -> Vec<u64> {
        vec![
            self.ch0.channel_id(),
            self.ch1.channel_id(),
            self.ch2.channel_id(),
        ]
    }
}

impl<M0, M1, M2> DataVisitor for DataVisitor3<M0, M1, M2>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
    M2: Clone + Send + 'static,
{
    type Fetched = (M0, M1, M2);

    fn try_fetch(&self) -> Option<(M0, M1, M2)> {
        let m2 = self.ch2.latest()?;
        let m1 = self.ch1.latest()?;
        let m0 = self.ch0.try_fetch()?;
        Some((m0, m1, m2))
    }
}

/// Visitor fusing a driving channel with three secondary channels.
pub struct DataVisitor4<M0, M1, M2, M3> {
    ch0: ChannelBuffer<M0>,
    ch1: ChannelBuffer<M1>,
    ch2: ChannelBuffer<M2>,
    ch3: ChannelBuffer<M3>,
}

impl<M0, M1, M2, M3> DataVisitor4<M0, M1, M2, M3>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
    M2: Clone + Send + 'static,
    M3: Clone + Send + 'static,
{
    pub fn new(
        ch0: ChannelBuffer<M0>,
        ch1: ChannelBuffer<M1>,
        ch2: ChannelBuffer<M2>,
        ch3: ChannelBuffer<M3>,
    ) -> DataVisitor4<M0, M1, M2, M3> {
        DataVisitor4 { ch0, ch1, ch2, ch3 }
    }
}

impl<M0, M1, M2, M3> DataVisitorBase for DataVisitor4<M0, M1, M2, M3>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
    M2: Clone + Send + 'static,
    M3: Clone + Send + 'static,
{
    fn channel_ids(&self) -> Vec<u64> {
        vec![
            self.ch0.channel_id(),
            self.ch1.channel_id(),
            self.ch2.channel_id(),
            self.ch3.channel_id(),
        ]
    }
}

impl<M0, M1, M2, M3> DataVisitor for DataVisitor4<M0, M1, M2, M3>
where
    M0: Clone + Send + 'static,
    M1: Clone + Send + 'static,
    M2: Clone + Send + 'static,
    M3: Clone + Send + 'static,
{
    type Fetched = (M0, M1, M2, M3);

    fn try_fetch(&self) -> Option<(M0, M1, M2, M3)> {
        let m3 = self.ch3.latest()?;
        let m2 = self.ch2.latest()?;
        let m1 = self.ch1.latest()?;
        let m0 = self.ch0.try_fetch()?;
        Some((m0, m1, m2, m3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_bounded() {
        let buf = ChannelBuffer::new(1, 2);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(buf.try_fetch(), Some(2));
        assert_eq!(buf.try_fetch(), Some(3));
        assert_eq!(buf.try_fetch(), None);
    }

    #[test]
    fn test_latest_does_not_consume() {
        let buf = ChannelBuffer::new(1, 4);
        buf.push(7);
        buf.push(8);
        assert_eq!(buf.latest(), Some(8));
        assert_eq!(buf.latest(), Some(8));
        assert_eq!(buf.try_fetch(), Some(7));
    }

    #[test]
    fn test_single_visitor_fetch() {
        let buf = ChannelBuffer::new(10, 4);
        let visitor = DataVisitor1::new(buf.clone());
        assert!(visitor.try_fetch().is_none());
        buf.push(42);
        assert_eq!(visitor.try_fetch(), Some(42));
        assert!(visitor.try_fetch().is_none());
        assert_eq!(visitor.channel_ids(), vec![10]);
    }

    #[test]
    fn test_fusion_requires_secondary() {
        let main = ChannelBuffer::new(1, 4);
        let side = ChannelBuffer::new(2, 4);
        let visitor = DataVisitor2::new(main.clone(), side.clone());

        main.push(1);
        // Secondary never observed anything: the driving message must
        // stay put.
        assert!(visitor.try_fetch().is_none());
        assert_eq!(main.latest(), Some(1));

        side.push(9);
        assert_eq!(visitor.try_fetch(), Some((1, 9)));
        // Driving channel drained, secondary stays sticky.
        assert!(visitor.try_fetch().is_none());
        main.push(2);
        assert_eq!(visitor.try_fetch(), Some((2, 9)));
    }
}
