//! Aggregation protocols exercising the meshsim engine.
//!
//! Two signature-aggregation state machines run on top of
//! [`meshsim_core`]:
//!
//! - [`P2PSignature`]: gossip-based aggregation where nodes trade signer
//!   bitsets with their peers, optionally accelerated by San Fermin
//!   sub-tree completion.
//! - [`Handel`]: level-based aggregation with reception/emission ranks,
//!   an adaptive verification window and a global blacklist.
//!
//! Both protocols are deterministic: all randomness comes from the
//! network's seeded RNG, and all iterated state lives in ordered
//! containers.

pub mod handel;
pub mod p2p_signature;

pub use handel::{Handel, HandelNode, HandelParameters, PERIOD_TIME};
pub use p2p_signature::{P2PSignature, P2PSignatureParameters, SendSigsStrategy, SigNode};
