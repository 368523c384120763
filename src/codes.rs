use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;

pub const TOKEN_LEN: usize = 32;

/// No 0/O, 1/I/L: codes get read out over the phone.
const BOOKING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Single-use confirmation token for the emailed link.
pub fn new_confirmation_token() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), TOKEN_LEN)
}

/// Human-readable `XXXX-XXXX` code shown to the customer after confirmation.
pub fn new_booking_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.gen_range(0..BOOKING_CODE_ALPHABET.len());
        code.push(BOOKING_CODE_ALPHABET[idx] as char);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_shape() {
        let t = new_confirmation_token();
        assert_eq!(t.len(), TOKEN_LEN);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tokens_do_not_repeat() {
        let tokens: HashSet<String> = (0..1000).map(|_| new_confirmation_token()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn booking_code_shape() {
        for _ in 0..100 {
            let code = new_booking_code();
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(
                code.chars()
                    .filter(|c| *c != '-')
                    .all(|c| BOOKING_CODE_ALPHABET.contains(&(c as u8)))
            );
            assert!(!code.contains('0') && !code.contains('O') && !code.contains('I'));
        }
    }
}
