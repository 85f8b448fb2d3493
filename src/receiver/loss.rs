//! The emulated loss channel.
//!
//! One Bernoulli trial per eligible segment: inbound DATA/SYN/FIN are
//! dropped with probability `flp`, outbound ACKs with probability `rlp`.
//! RESET segments never pass through the channel. The RNG is seeded once so
//! a run is reproducible given its seed.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
pub struct LossChannel {
    rng: SmallRng,
    flp: f64,
    rlp: f64,
}

impl LossChannel {
    pub fn new(seed: u64, flp: f64, rlp: f64) -> Self {
        LossChannel {
            rng: SmallRng::seed_from_u64(seed),
            flp,
            rlp,
        }
    }

    /// Trial for an inbound DATA, SYN, or FIN segment.
    pub fn drop_inbound(&mut self) -> bool {
        self.rng.gen_bool(self.flp)
    }

    /// Trial for an outbound ACK.
    pub fn drop_ack(&mut self) -> bool {
        self.rng.gen_bool(self.rlp)
    }
}
