//! Shannon stream cipher with integrated MAC.
//!
//! Word-oriented port of the reference design: a 16-word nonlinear feedback
//! register, a parallel CRC register that accumulates plaintext for the MAC,
//! and byte-granular buffering so a message may be processed in several
//! calls (the frame header and body are decrypted separately).

use std::fmt;

use zeroize::Zeroize;

const N: usize = 16;
const KEY_WORD: usize = 13;
const INIT_KONST: u32 = 0x6996_c53a;

#[derive(Clone)]
pub struct Shannon {
    r: [u32; N],
    crc: [u32; N],
    init_r: [u32; N],
    konst: u32,
    sbuf: u32,
    mbuf: u32,
    nbuf: u32,
}

impl fmt::Debug for Shannon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shannon")
            .field("buffered_bits", &self.nbuf)
            .finish_non_exhaustive()
    }
}

impl Shannon {
    /// Key the cipher. A nonce must be set before any stream operation.
    pub fn new(key: &[u8]) -> Self {
        let mut cipher = Self {
            r: [0; N],
            crc: [0; N],
            init_r: [0; N],
            konst: INIT_KONST,
            sbuf: 0,
            mbuf: 0,
            nbuf: 0,
        };
        cipher.init_state();
        cipher.load_key(key);
        cipher.konst = cipher.r[0];
        cipher.init_r = cipher.r;
        cipher
    }

    /// Reset to the keyed state and fold in `nonce`.
    pub fn nonce(&mut self, nonce: &[u8]) {
        self.r = self.init_r;
        self.konst = INIT_KONST;
        self.load_key(nonce);
        self.konst = self.r[0];
        self.nbuf = 0;
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        let mut i = 0;
        let mut n = buf.len();

        if self.nbuf != 0 {
            while self.nbuf != 0 && n != 0 {
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                buf[i] ^= (self.sbuf >> (32 - self.nbuf)) as u8;
                i += 1;
                self.nbuf -= 8;
                n -= 1;
            }
            if self.nbuf != 0 {
                return;
            }
            self.mac_word(self.mbuf);
        }

        let end = i + (n & !0x03);
        while i < end {
            self.cycle();
            let word = load_word(&buf[i..i + 4]);
            self.mac_word(word);
            store_word(&mut buf[i..i + 4], word ^ self.sbuf);
            i += 4;
        }

        n &= 0x03;
        if n != 0 {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;
            while self.nbuf != 0 && n != 0 {
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                buf[i] ^= (self.sbuf >> (32 - self.nbuf)) as u8;
                i += 1;
                self.nbuf -= 8;
                n -= 1;
            }
        }
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        let mut i = 0;
        let mut n = buf.len();

        if self.nbuf != 0 {
            while self.nbuf != 0 && n != 0 {
                buf[i] ^= (self.sbuf >> (32 - self.nbuf)) as u8;
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                i += 1;
                self.nbuf -= 8;
                n -= 1;
            }
            if self.nbuf != 0 {
                return;
            }
            self.mac_word(self.mbuf);
        }

        let end = i + (n & !0x03);
        while i < end {
            self.cycle();
            let word = load_word(&buf[i..i + 4]) ^ self.sbuf;
            self.mac_word(word);
            store_word(&mut buf[i..i + 4], word);
            i += 4;
        }

        n &= 0x03;
        if n != 0 {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;
            while self.nbuf != 0 && n != 0 {
                buf[i] ^= (self.sbuf >> (32 - self.nbuf)) as u8;
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                i += 1;
                self.nbuf -= 8;
                n -= 1;
            }
        }
    }

    /// Produce the MAC over everything processed since the last nonce.
    pub fn finish(&mut self, out: &mut [u8]) {
        if self.nbuf != 0 {
            self.mac_word(self.mbuf);
        }

        self.cycle();
        self.r[KEY_WORD] ^= INIT_KONST ^ (self.nbuf << 3);
        self.nbuf = 0;

        for (word, crc) in self.r.iter_mut().zip(self.crc.iter()) {
            *word ^= *crc;
        }
        self.diffuse();

        for chunk in out.chunks_mut(4) {
            self.cycle();
            let bytes = self.sbuf.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn init_state(&mut self) {
        self.r[0] = 1;
        self.r[1] = 1;
        for i in 2..N {
            self.r[i] = self.r[i - 1].wrapping_add(self.r[i - 2]);
        }
        self.konst = INIT_KONST;
    }

    fn cycle(&mut self) {
        let mut t = self.r[12] ^ self.r[13] ^ self.konst;
        t = sbox1(t) ^ self.r[0].rotate_left(1);
        self.r.copy_within(1.., 0);
        self.r[N - 1] = t;
        let t = sbox2(self.r[2] ^ self.r[15]);
        self.r[0] ^= t;
        self.sbuf = t ^ self.r[8] ^ self.r[12];
    }

    fn crc_word(&mut self, word: u32) {
        let t = self.crc[0] ^ self.crc[2] ^ self.crc[15] ^ word;
        self.crc.copy_within(1.., 0);
        self.crc[N - 1] = t;
    }

    fn mac_word(&mut self, word: u32) {
        self.crc_word(word);
        self.r[KEY_WORD] ^= word;
    }

    fn diffuse(&mut self) {
        for _ in 0..N {
            self.cycle();
        }
    }

    fn load_key(&mut self, key: &[u8]) {
        let mut words = key.chunks_exact(4);
        for word in &mut words {
            self.r[KEY_WORD] ^= load_word(word);
            self.cycle();
        }

        let tail = words.remainder();
        if !tail.is_empty() {
            let mut extra = [0u8; 4];
            extra[..tail.len()].copy_from_slice(tail);
            self.r[KEY_WORD] ^= u32::from_le_bytes(extra);
            self.cycle();
        }

        self.r[KEY_WORD] ^= key.len() as u32;
        self.cycle();

        self.crc = self.r;
        self.diffuse();
        for (word, saved) in self.r.iter_mut().zip(self.crc.iter()) {
            *word ^= *saved;
        }
    }
}

impl Drop for Shannon {
    fn drop(&mut self) {
        self.r.zeroize();
        self.crc.zeroize();
        self.init_r.zeroize();
        self.konst.zeroize();
        self.sbuf.zeroize();
        self.mbuf.zeroize();
    }
}

fn sbox1(mut w: u32) -> u32 {
    w ^= w.rotate_left(5) | w.rotate_left(7);
    w ^= w.rotate_left(19) | w.rotate_left(22);
    w
}

fn sbox2(mut w: u32) -> u32 {
    w ^= w.rotate_left(7) | w.rotate_left(22);
    w ^= w.rotate_left(5) | w.rotate_left(19);
    w
}

fn load_word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn store_word(bytes: &mut [u8], word: u32) {
    bytes.copy_from_slice(&word.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [
        0xda, 0x3c, 0x70, 0xf5, 0x3a, 0x89, 0xa1, 0x2c, 0x36, 0x9e, 0x1a, 0xca, 0x5e, 0xa0, 0xdc,
        0x6f, 0xb1, 0x6c, 0xe3, 0x5f, 0x14, 0xb6, 0xe6, 0xbe, 0xcf, 0x73, 0x86, 0xc8, 0x74, 0xda,
        0xc0, 0x69,
    ];
    const TEXT: &[u8] = b"This is a secret text. And I need to make it longer. Longer. And even longer.";

    #[test]
    fn split_decrypt_matches_single_encrypt() {
        let mut sender = Shannon::new(&KEY);
        sender.nonce(&[0, 0, 0, 0]);
        let mut data = TEXT.to_vec();
        sender.encrypt(&mut data);
        assert_ne!(data.as_slice(), TEXT);

        let mut receiver = Shannon::new(&KEY);
        receiver.nonce(&[0, 0, 0, 0]);
        let (head, tail) = data.split_at_mut(3);
        receiver.decrypt(head);
        receiver.decrypt(tail);
        assert_eq!(data.as_slice(), TEXT);
    }

    #[test]
    fn mac_agrees_between_directions() {
        let mut sender = Shannon::new(&KEY);
        sender.nonce(&7u32.to_be_bytes());
        let mut data = TEXT.to_vec();
        sender.encrypt(&mut data);
        let mut sent_mac = [0u8; 4];
        sender.finish(&mut sent_mac);

        let mut receiver = Shannon::new(&KEY);
        receiver.nonce(&7u32.to_be_bytes());
        let (head, tail) = data.split_at_mut(5);
        receiver.decrypt(head);
        receiver.decrypt(tail);
        let mut recv_mac = [0u8; 4];
        receiver.finish(&mut recv_mac);

        assert_eq!(sent_mac, recv_mac);
    }

    #[test]
    fn nonce_changes_keystream() {
        let mut a = Shannon::new(&KEY);
        let mut b = Shannon::new(&KEY);
        a.nonce(&0u32.to_be_bytes());
        b.nonce(&1u32.to_be_bytes());
        let mut first = TEXT.to_vec();
        let mut second = TEXT.to_vec();
        a.encrypt(&mut first);
        b.encrypt(&mut second);
        assert_ne!(first, second);
    }

    #[test]
    fn reused_nonce_reproduces_keystream() {
        let mut cipher = Shannon::new(&KEY);
        cipher.nonce(&3u32.to_be_bytes());
        let mut first = TEXT.to_vec();
        cipher.encrypt(&mut first);
        let mut mac = [0u8; 4];
        cipher.finish(&mut mac);

        cipher.nonce(&3u32.to_be_bytes());
        let mut second = TEXT.to_vec();
        cipher.encrypt(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn tampering_breaks_mac() {
        let mut sender = Shannon::new(&KEY);
        sender.nonce(&[0, 0, 0, 9]);
        let mut data = TEXT.to_vec();
        sender.encrypt(&mut data);
        let mut sent_mac = [0u8; 4];
        sender.finish(&mut sent_mac);

        data[10] ^= 0x01;
        let mut receiver = Shannon::new(&KEY);
        receiver.nonce(&[0, 0, 0, 9]);
        receiver.decrypt(&mut data);
        let mut recv_mac = [0u8; 4];
        receiver.finish(&mut recv_mac);
        assert_ne!(sent_mac, recv_mac);
    }

    #[test]
    fn partial_mac_output_is_prefix_of_word() {
        let mut a = Shannon::new(&KEY);
        let mut b = Shannon::new(&KEY);
        a.nonce(&[1]);
        b.nonce(&[1]);
        let mut short = [0u8; 3];
        let mut full = [0u8; 4];
        a.finish(&mut short);
        b.finish(&mut full);
        assert_eq!(short, full[..3]);
    }
}
