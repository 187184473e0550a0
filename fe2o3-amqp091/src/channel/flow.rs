//! Channel flow control

use std::collections::VecDeque;

use fe2o3_amqp091_types::method::Method;

use crate::content::{Content, Message};

/// Where a content-bearing server method is delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Route {
    /// `basic.deliver` for a consumer tag
    Consumer(String),

    /// `basic.return`
    Returned,
}

/// Holds deliveries while the local flow switch is off, and publishes while the broker has
/// asked us to pause.
#[derive(Debug)]
pub(crate) struct FlowController {
    active: bool,
    held: VecDeque<(Route, Message)>,

    remote_active: bool,
    held_publishes: VecDeque<(Method, Content)>,
}

impl Default for FlowController {
    fn default() -> Self {
        Self {
            active: true,
            held: VecDeque::new(),
            remote_active: true,
            held_publishes: VecDeque::new(),
        }
    }
}

impl FlowController {
    /// Returns the delivery back if it may go to its queue now
    pub fn admit(&mut self, route: Route, message: Message) -> Option<(Route, Message)> {
        match self.active {
            true => Some((route, message)),
            false => {
                self.held.push_back((route, message));
                None
            }
        }
    }

    /// Flips the local switch. Turning flow on releases every held delivery in arrival order.
    pub fn set_active(&mut self, active: bool) -> Vec<(Route, Message)> {
        self.active = active;
        match active {
            true => self.held.drain(..).collect(),
            false => Vec::new(),
        }
    }

    pub fn is_publish_paused(&self) -> bool {
        !self.remote_active
    }

    pub fn hold_publish(&mut self, method: Method, content: Content) {
        self.held_publishes.push_back((method, content));
    }

    /// Applies a `channel.flow` sent by the broker. Resuming releases held publishes in order.
    pub fn set_remote_active(&mut self, active: bool) -> Vec<(Method, Content)> {
        self.remote_active = active;
        match active {
            true => self.held_publishes.drain(..).collect(),
            false => Vec::new(),
        }
    }

    /// Everything still held, used when the channel closes
    pub fn take_held(&mut self) -> Vec<(Route, Message)> {
        self.held.drain(..).collect()
    }
}
