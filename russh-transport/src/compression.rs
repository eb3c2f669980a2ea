// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Compression algorithm names, for use with [Preferred](crate::Preferred).
use std::convert::TryFrom;

use delegate::delegate;
use ssh_encoding::Encode;

use crate::{CryptoVec, Error};

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Encode for Name {
    delegate! { to self.as_ref() {
        fn encoded_len(&self) -> Result<usize, ssh_encoding::Error>;
        fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error>;
    }}
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        ALL_COMPRESSION_ALGORITHMS
            .iter()
            .find(|x| x.0 == s)
            .map(|x| **x)
            .ok_or(())
    }
}

/// `none`
pub const NONE: Name = Name("none");
/// `zlib`
#[cfg(feature = "flate2")]
pub const ZLIB: Name = Name("zlib");
/// `zlib@openssh.com`, only enabled once the user is authenticated.
#[cfg(feature = "flate2")]
pub const ZLIB_LEGACY: Name = Name("zlib@openssh.com");

pub const ALL_COMPRESSION_ALGORITHMS: &[&Name] = &[
    &NONE,
    #[cfg(feature = "flate2")]
    &ZLIB,
    #[cfg(feature = "flate2")]
    &ZLIB_LEGACY,
];

/// A negotiated compression method, for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    #[cfg(feature = "flate2")]
    Zlib {
        /// `zlib@openssh.com`: start compressing after USERAUTH_SUCCESS.
        delayed: bool,
    },
}

#[derive(Debug)]
pub enum Compress {
    None,
    #[cfg(feature = "flate2")]
    Zlib(flate2::Compress),
}

#[derive(Debug)]
pub enum Decompress {
    None,
    #[cfg(feature = "flate2")]
    Zlib(flate2::Decompress),
}

impl Compression {
    pub fn new(name: &Name) -> Self {
        match name.0 {
            #[cfg(feature = "flate2")]
            "zlib" => Compression::Zlib { delayed: false },
            #[cfg(feature = "flate2")]
            "zlib@openssh.com" => Compression::Zlib { delayed: true },
            _ => Compression::None,
        }
    }

    pub fn is_delayed(&self) -> bool {
        match self {
            #[cfg(feature = "flate2")]
            Compression::Zlib { delayed } => *delayed,
            Compression::None => false,
        }
    }

    /// Set up the compressor for new keys. A running zlib stream is
    /// kept across rekeys. Delayed compression stays off until
    /// `authenticated`.
    #[cfg_attr(not(feature = "flate2"), allow(unused_variables))]
    pub fn init_compress(&self, comp: &mut Compress, authenticated: bool) {
        match self {
            #[cfg(feature = "flate2")]
            Compression::Zlib { delayed } if !delayed || authenticated => {
                if !comp.is_active() {
                    *comp =
                        Compress::Zlib(flate2::Compress::new(flate2::Compression::fast(), true))
                }
            }
            _ => *comp = Compress::None,
        }
    }

    #[cfg_attr(not(feature = "flate2"), allow(unused_variables))]
    pub fn init_decompress(&self, comp: &mut Decompress, authenticated: bool) {
        match self {
            #[cfg(feature = "flate2")]
            Compression::Zlib { delayed } if !delayed || authenticated => {
                if !comp.is_active() {
                    *comp = Decompress::Zlib(flate2::Decompress::new(true))
                }
            }
            _ => *comp = Decompress::None,
        }
    }
}

impl Compress {
    pub fn is_active(&self) -> bool {
        !matches!(self, Compress::None)
    }

    pub fn compress<'a>(
        &mut self,
        input: &'a [u8],
        output: &'a mut CryptoVec,
    ) -> Result<&'a [u8], Error> {
        match *self {
            Compress::None => Ok(input),
            #[cfg(feature = "flate2")]
            Compress::Zlib(ref mut z) => {
                output.clear();
                let n_in = z.total_in() as usize;
                let n_out = z.total_out() as usize;
                output.resize(input.len() + 64);
                loop {
                    let consumed = z.total_in() as usize - n_in;
                    let produced = z.total_out() as usize - n_out;
                    let (Some(rest), Some(out)) = (input.get(consumed..), output.get_mut(produced..))
                    else {
                        return Err(Error::IndexOutOfBounds);
                    };
                    let out_len = out.len();
                    let before = z.total_out();
                    z.compress(rest, out, flate2::FlushCompress::Partial)?;
                    let written = (z.total_out() - before) as usize;
                    // A full output buffer may hide pending flushed bytes.
                    if z.total_in() as usize - n_in == input.len() && written < out_len {
                        break;
                    }
                    let len = output.len();
                    output.resize(len * 2);
                }
                let produced = z.total_out() as usize - n_out;
                output.get(..produced).ok_or(Error::IndexOutOfBounds)
            }
        }
    }
}

impl Decompress {
    pub fn is_active(&self) -> bool {
        !matches!(self, Decompress::None)
    }

    pub fn decompress<'a>(
        &mut self,
        input: &'a [u8],
        output: &'a mut CryptoVec,
    ) -> Result<&'a [u8], Error> {
        match *self {
            Decompress::None => Ok(input),
            #[cfg(feature = "flate2")]
            Decompress::Zlib(ref mut z) => {
                output.clear();
                let n_in = z.total_in() as usize;
                let n_out = z.total_out() as usize;
                output.resize(input.len().max(64) * 4);
                loop {
                    let consumed = z.total_in() as usize - n_in;
                    let produced = z.total_out() as usize - n_out;
                    let (Some(rest), Some(out)) = (input.get(consumed..), output.get_mut(produced..))
                    else {
                        return Err(Error::IndexOutOfBounds);
                    };
                    let out_len = out.len();
                    let before = z.total_out();
                    z.decompress(rest, out, flate2::FlushDecompress::Sync)?;
                    let written = (z.total_out() - before) as usize;
                    if z.total_in() as usize - n_in == input.len() && written < out_len {
                        break;
                    }
                    if written == 0 && z.total_in() as usize - n_in == consumed {
                        // No progress: truncated or corrupted stream.
                        return Err(Error::Inconsistent);
                    }
                    let len = output.len();
                    output.resize(len * 2);
                }
                let produced = z.total_out() as usize - n_out;
                output.get(..produced).ok_or(Error::IndexOutOfBounds)
            }
        }
    }
}
