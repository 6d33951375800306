use cmac::digest;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Provides a [`Debug`] implementation for a type containing sensitive data.
///
/// [`Debug`]: std::fmt::Debug
macro_rules! debug_secret {
    ($T:ty) => {
        impl ::std::fmt::Debug for $T {
            #[inline]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_tuple(stringify!($T)).field(&"<secret>").finish()
            }
        }
    };
}

/// RFC-4493 AES-CMAC ([Vol 3] Part H, Section 2.2.5).
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct AesCmac(cmac::Cmac<aes::Aes128>);

impl AesCmac {
    /// Creates new AES-CMAC state using key `k`.
    #[inline(always)]
    #[must_use]
    pub fn new(k: &Key) -> Self {
        Self(digest::KeyInit::new(&k.0))
    }

    /// Creates new AES-CMAC state using an all-zero key for the GATT database
    /// hash calculation ([Vol 3] Part G, Section 7.3.1).
    #[inline(always)]
    #[must_use]
    pub fn db_hash() -> Self {
        Self::new(&Key::new(0))
    }

    /// Updates CMAC state.
    #[inline(always)]
    pub fn update(&mut self, b: impl AsRef<[u8]>) -> &mut Self {
        digest::Update::update(&mut self.0, b.as_ref());
        self
    }

    /// Adds one attribute to a database hash. The value is omitted for
    /// descriptors that contribute only their handle and type.
    #[inline]
    pub fn attr(&mut self, hdl: u16, typ: &[u8], val: Option<&[u8]>) -> &mut Self {
        self.update(hdl.to_le_bytes()).update(typ);
        if let Some(v) = val {
            self.update(v);
        }
        self
    }

    /// Computes the final MAC value.
    #[inline(always)]
    #[must_use]
    pub fn finalize(self) -> u128 {
        u128::from_be_bytes(*digest::FixedOutput::finalize_fixed(self.0).as_ref())
    }
}

/// 128-bit AES-CMAC key ([Vol 3] Part H, Section 2.2.5).
#[derive(Zeroize, ZeroizeOnDrop)]
#[must_use]
#[repr(transparent)]
pub struct Key(aes::cipher::Key<aes::Aes128>);

debug_secret!(Key);

impl Key {
    /// Creates a key from a `u128` value.
    #[inline(always)]
    pub fn new(k: u128) -> Self {
        Self(k.to_be_bytes().into())
    }
}

#[allow(clippy::unusual_byte_groupings)]
#[cfg(test)]
mod tests {
    use super::*;

    /// AES-CMAC RFC-4493 test vectors ([Vol 3] Part H, Section D.1).
    #[test]
    fn aes_cmac() {
        const fn b(v: u128) -> [u8; 16] {
            v.to_be_bytes()
        }
        let k = Key::new(0x2b7e1516_28aed2a6_abf71588_09cf4f3c);
        assert_eq!(
            AesCmac::new(&k).finalize(),
            0xbb1d6929_e9593728_7fa37d12_9b756746
        );

        let mut m = AesCmac::new(&k);
        m.update(b(0x6bc1bee2_2e409f96_e93d7e11_7393172a));
        assert_eq!(m.finalize(), 0x070a16b4_6b4d4144_f79bdd9d_d04a287c);

        let mut m = AesCmac::new(&k);
        m.update(b(0x6bc1bee2_2e409f96_e93d7e11_7393172a));
        m.update(b(0xae2d8a57_1e03ac9c_9eb76fac_45af8e51));
        m.update(0x30c81c46_a35ce411_u64.to_be_bytes());
        assert_eq!(m.finalize(), 0xdfa66747_de9ae630_30ca3261_1497c827);

        let mut m = AesCmac::new(&k);
        m.update(b(0x6bc1bee2_2e409f96_e93d7e11_7393172a));
        m.update(b(0xae2d8a57_1e03ac9c_9eb76fac_45af8e51));
        m.update(b(0x30c81c46_a35ce411_e5fbc119_1a0a52ef));
        m.update(b(0xf69f2445_df4f9b17_ad2b417b_e66c3710));
        assert_eq!(m.finalize(), 0x51f0bebf_7e3b9d92_fc497417_79363cfe);
    }

    #[test]
    fn attr() {
        let mut a = AesCmac::db_hash();
        a.attr(0x0001, &[0x00, 0x28], Some(&[0x00, 0x18]));
        let mut b = AesCmac::db_hash();
        b.update([0x01, 0x00, 0x00, 0x28, 0x00, 0x18]);
        assert_eq!(a.clone().finalize(), b.finalize());

        let mut c = AesCmac::db_hash();
        c.attr(0x0001, &[0x00, 0x28], None);
        assert_ne!(a.finalize(), c.finalize());
    }
}
