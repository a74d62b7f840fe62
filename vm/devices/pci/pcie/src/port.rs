// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seams between the fabric and the things attached to it.

use crate::tlp::Tlp;

/// Receives packets that leave the fabric through the host bridge's upstream
/// link.
pub trait TlpSink: Send {
    /// Accept a packet.
    fn send(&mut self, tlp: Tlp);
}

/// The behavior of a function, invoked for packets that terminate at it
/// (other than configuration requests, which the fabric services from the
/// function's register file).
pub trait TlpHandler: Send {
    /// Consume `tlp`. Packets pushed to `responses` are transmitted by the
    /// function, in order, once the handler returns.
    fn handle_tlp(&mut self, tlp: Tlp, responses: &mut Vec<Tlp>);
}

impl<F> TlpHandler for F
where
    F: FnMut(Tlp, &mut Vec<Tlp>) + Send,
{
    fn handle_tlp(&mut self, tlp: Tlp, responses: &mut Vec<Tlp>) {
        (self)(tlp, responses)
    }
}

/// How a packet reached the node processing it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Received on the node's upstream link.
    FromUpstream,
    /// Received on one of the node's downstream links.
    FromDownstream,
    /// Transmitted by the node itself.
    Originated,
}
