//! Behavioural suites exercising two routers over a real socket.

mod connection_behaviour;
mod message_routing_behaviour;
mod support;
