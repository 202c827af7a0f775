use crate::{
    HeapIdx, Message, RingBuffer, Value, Vm, VmError, VmState, message::deserialize,
    vstig::Record,
};

/// Incoming messages waiting for [`Vm::process_inmsgs`]. Payload values are
/// heap objects kept PERMANENT while queued.
#[derive(Debug, Clone)]
pub struct InMsgQueue {
    queue: RingBuffer<Message<HeapIdx>>,
}

impl InMsgQueue {
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

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message<HeapIdx>> {
        self.queue.iter()
    }
}

impl Vm {
    /// Decode a received payload and queue it. Malformed payloads are dropped
    /// without an error. When the queue is full the oldest message is lost.
    pub fn inmsg_append(&mut self, payload: &[u8]) -> Result<(), VmError> {
        let Some(msg) = deserialize(payload) else {
            log::warn!("dropping malformed message of {} bytes", payload.len());
            return Ok(());
        };
        let value = match msg.value() {
            // a fresh object even for nil, the shared nil must stay permanent
            Some(&value) => {
                let idx = self.heap.alloc_value(value)?;
                self.heap.make_permanent(idx);
                idx
            }
            None => self.nil,
        };
        let msg = msg.map_value(|_| value);
        if let Some(evicted) = self.inmsgs.queue.push(msg) {
            self.release_inmsg(&evicted);
        }
        Ok(())
    }

    fn release_inmsg(&mut self, msg: &Message<HeapIdx>) {
        if let Some(&value) = msg.value() {
            self.heap.clear_permanent(value);
        }
    }

    /// Dispatch every queued message: broadcasts to their listeners,
    /// stigmergy traffic to the store and swarm traffic to the swarm list.
    /// Runs once the script is ready or done; a failing callback puts the
    /// VM in the error state and stops processing.
    pub fn process_inmsgs(&mut self) {
        if !matches!(self.state, VmState::Ready | VmState::Done) {
            return;
        }
        while let Some(msg) = self.inmsgs.queue.pop() {
            let result = self.dispatch_inmsg(msg);
            self.release_inmsg(&msg);
            if let Err(err) = result {
                self.set_error(err);
                return;
            }
        }
    }

    fn dispatch_inmsg(&mut self, msg: Message<HeapIdx>) -> Result<(), VmError> {
        match msg {
            Message::Broadcast {
                robot,
                topic,
                value,
            } => {
                if !self.strings.contains(topic) {
                    log::warn!("dropping broadcast from robot {robot}: unknown topic {topic}");
                    return Ok(());
                }
                let topic = self.alloc_value(Value::String(topic))?;
                self.deliver_broadcast(robot, topic, value)
            }
            Message::Vstig {
                op,
                robot,
                key,
                value,
                lamport,
            } => self.vstig_receive(
                op,
                key,
                Record {
                    robot,
                    value,
                    timestamp: lamport,
                },
            ),
            Message::Swarm {
                op,
                robot,
                lamport,
                swarms,
            } => {
                if robot != self.robot {
                    self.swarm.apply(op, robot, lamport, swarms);
                }
                Ok(())
            }
        }
    }

    /// Per-tick outgoing work: ages the swarm list and periodically
    /// announces local swarm membership.
    pub fn process_outmsgs(&mut self) {
        if let Some(msg) = self.swarm.tick(self.robot) {
            self.queue_outmsg(msg);
        }
    }
}
