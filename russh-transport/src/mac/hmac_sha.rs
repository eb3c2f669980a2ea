use std::marker::PhantomData;

use digest::typenum::Unsigned;
use digest::{KeyInit, OutputSizeUser};
use generic_array::GenericArray;
use subtle::ConstantTimeEq;

use super::{Mac, MacAlgorithm};
use crate::Error;

/// HMAC over `sequence_number || data`. The key is as long as the
/// digest output for every algorithm we offer.
pub struct HmacAlgorithm<M> {
    etm: bool,
    _mac: PhantomData<fn() -> M>,
}

impl<M> HmacAlgorithm<M> {
    pub const fn new(etm: bool) -> Self {
        HmacAlgorithm {
            etm,
            _mac: PhantomData,
        }
    }
}

/// A keyed HMAC state, cloned for every packet.
struct Keyed<M> {
    hmac: M,
    etm: bool,
}

impl<M: digest::Mac + KeyInit + Clone + Send + 'static> MacAlgorithm for HmacAlgorithm<M> {
    fn key_len(&self) -> usize {
        <M as OutputSizeUser>::OutputSize::USIZE
    }

    fn make_mac(&self, mac_key: &[u8]) -> Result<Box<dyn Mac + Send>, Error> {
        if mac_key.len() != self.key_len() {
            return Err(Error::Kex);
        }
        let hmac = <M as KeyInit>::new_from_slice(mac_key).map_err(|_| Error::Kex)?;
        Ok(Box::new(Keyed {
            hmac,
            etm: self.etm,
        }))
    }
}

impl<M: digest::Mac + Clone> Keyed<M> {
    fn tag(&self, sequence_number: u32, payload: &[u8]) -> GenericArray<u8, M::OutputSize> {
        let mut hmac = self.hmac.clone();
        digest::Mac::update(&mut hmac, &sequence_number.to_be_bytes());
        digest::Mac::update(&mut hmac, payload);
        hmac.finalize().into_bytes()
    }
}

impl<M: digest::Mac + Clone + Send> Mac for Keyed<M> {
    fn mac_len(&self) -> usize {
        M::OutputSize::USIZE
    }

    fn is_etm(&self) -> bool {
        self.etm
    }

    fn compute(&self, sequence_number: u32, payload: &[u8], output: &mut [u8]) {
        for (out, b) in output.iter_mut().zip(self.tag(sequence_number, payload)) {
            *out = b;
        }
    }

    fn verify(&self, sequence_number: u32, payload: &[u8], mac: &[u8]) -> bool {
        self.tag(sequence_number, payload).as_slice().ct_eq(mac).into()
    }
}
