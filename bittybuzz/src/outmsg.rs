use crate::{Message, RingBuffer, Value, Vm, message::serialize};

/// Outgoing messages, kept in priority order.
#[derive(Debug, Clone)]
pub struct OutMsgQueue {
    queue: RingBuffer<Message<Value>>,
}

impl OutMsgQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: RingBuffer::new(capacity),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.queue.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `msg` behind every message of the same or higher priority.
    /// When full, the oldest message is dropped and returned.
    pub fn append(&mut self, msg: Message<Value>) -> Option<Message<Value>> {
        let evicted = self.queue.push(msg);
        let mut pos = self.queue.size() - 1;
        while pos > 0 {
            let (Some(prev), Some(cur)) = (self.queue.get(pos - 1), self.queue.get(pos)) else {
                break;
            };
            if prev.kind() <= cur.kind() {
                break;
            }
            self.queue.swap(pos - 1, pos);
            pos -= 1;
        }
        evicted
    }

    pub fn first(&self) -> Option<&Message<Value>> {
        self.queue.get(0)
    }

    /// Serialize the head message into `buf`. Returns `None` without writing
    /// when the queue is empty or the head cannot be flattened; the caller
    /// still has to call [`OutMsgQueue::next`] to move past it.
    pub fn first_into(&self, buf: &mut [u8]) -> Option<usize> {
        serialize(self.first()?, buf)
    }

    /// Drop the head message.
    pub fn next(&mut self) -> Option<Message<Value>> {
        self.queue.pop()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message<Value>> {
        self.queue.iter()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Vm {
    pub(crate) fn queue_outmsg(&mut self, msg: Message<Value>) {
        if let Some(evicted) = self.outmsgs.append(msg) {
            log::trace!("outgoing queue full, dropped {:?}", evicted.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{MESSAGE_SIZE, MsgKind, SwarmOp, Table, VstigOp};

    use super::*;

    fn swarm(op: SwarmOp) -> Message<Value> {
        Message::Swarm {
            op,
            robot: 1,
            lamport: 0,
            swarms: 1,
        }
    }

    fn broadcast(value: Value) -> Message<Value> {
        Message::Broadcast {
            robot: 1,
            topic: 40,
            value,
        }
    }

    #[test]
    fn appended_messages_are_sorted_by_priority() {
        let mut queue = OutMsgQueue::new(8);
        queue.append(swarm(SwarmOp::Leave));
        queue.append(Message::Vstig {
            op: VstigOp::Put,
            robot: 1,
            key: 40,
            value: Value::Int(1),
            lamport: 1,
        });
        queue.append(swarm(SwarmOp::List));
        queue.append(broadcast(Value::Int(3)));

        let kinds: Vec<_> = queue.iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                MsgKind::Broadcast,
                MsgKind::SwarmList,
                MsgKind::VstigPut,
                MsgKind::SwarmLeave
            ]
        );
    }

    #[test]
    fn equal_priorities_keep_arrival_order() {
        let mut queue = OutMsgQueue::new(8);
        queue.append(broadcast(Value::Int(1)));
        queue.append(swarm(SwarmOp::Join));
        queue.append(broadcast(Value::Int(2)));
        let values: Vec<_> = queue.iter().filter_map(|m| m.value().copied()).collect();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn unserializable_head_is_skipped_by_caller() {
        let mut queue = OutMsgQueue::new(8);
        queue.append(broadcast(Value::Table(Table {
            head: 0,
            darray: false,
            cloned: false,
        })));
        queue.append(broadcast(Value::Int(5)));

        let mut buf = [0u8; MESSAGE_SIZE];
        assert_eq!(queue.first_into(&mut buf), None);
        queue.next();
        assert_eq!(queue.first_into(&mut buf), Some(8));
        queue.next();
        assert!(queue.is_empty());
        assert_eq!(queue.first_into(&mut buf), None);
    }
}
