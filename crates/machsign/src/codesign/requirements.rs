//! Requirement set blobs.
//!
//! Identity signatures carry a designated requirement equivalent to
//!
//! ```text
//! identifier "<id>" and anchor apple generic
//!     and certificate leaf[subject.CN] = "<common name>"
//!     and certificate 1[field.1.2.840.113635.100.6.2.1] exists
//! ```
//!
//! Ad-hoc signatures carry an empty requirement set.

use super::constants::*;
use super::superblob::wrap_blob;

/// DER body of OID 1.2.840.113635.100.6.2.1 (Apple WWDR intermediate marker).
const WWDR_INTERMEDIATE_OID: [u8; 10] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];

/// Requirement expression in prefix opcode form.
#[derive(Default)]
struct Expr {
    buf: Vec<u8>,
}

impl Expr {
    fn op(&mut self, op: u32) -> &mut Self {
        self.buf.extend_from_slice(&op.to_be_bytes());
        self
    }

    /// Length-prefixed data padded to 4 bytes.
    fn data(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        let pad = (4 - bytes.len() % 4) % 4;
        self.buf.extend(std::iter::repeat(0).take(pad));
        self
    }
}

/// Requirement set with no requirements (12 bytes).
pub fn empty_requirements() -> Vec<u8> {
    wrap_blob(CSMAGIC_REQUIREMENTS, &0u32.to_be_bytes())
}

/// Requirement set holding the designated requirement for `identifier`
/// signed by a certificate with `common_name`.
pub fn designated_requirements(identifier: &str, common_name: &str) -> Vec<u8> {
    let mut expr = Expr::default();
    expr.op(OP_AND)
        .op(OP_IDENT)
        .data(identifier.as_bytes())
        .op(OP_AND)
        .op(OP_APPLE_GENERIC_ANCHOR)
        .op(OP_AND)
        .op(OP_CERT_FIELD)
        .op(0)
        .data(b"subject.CN")
        .op(MATCH_EQUAL)
        .data(common_name.as_bytes())
        .op(OP_CERT_GENERIC)
        .op(1)
        .data(&WWDR_INTERMEDIATE_OID)
        .op(MATCH_EXISTS);

    let mut requirement = REQ_EXPR_FORM.to_be_bytes().to_vec();
    requirement.extend_from_slice(&expr.buf);
    let requirement = wrap_blob(CSMAGIC_REQUIREMENT, &requirement);

    // count, then a single (type, offset) index entry
    let mut set = Vec::with_capacity(12 + requirement.len());
    set.extend_from_slice(&1u32.to_be_bytes());
    set.extend_from_slice(&CSREQ_DESIGNATED.to_be_bytes());
    set.extend_from_slice(&20u32.to_be_bytes());
    set.extend_from_slice(&requirement);
    wrap_blob(CSMAGIC_REQUIREMENTS, &set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be32(b: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(b[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_empty_requirements() {
        let blob = empty_requirements();
        assert_eq!(blob.len(), 12);
        assert_eq!(be32(&blob, 0), CSMAGIC_REQUIREMENTS);
        assert_eq!(be32(&blob, 4), 12);
        assert_eq!(be32(&blob, 8), 0);
    }

    #[test]
    fn test_designated_layout() {
        let blob = designated_requirements("com.example.app", "Apple Development: Jo (AB12CD34EF)");
        assert_eq!(be32(&blob, 0), CSMAGIC_REQUIREMENTS);
        assert_eq!(be32(&blob, 4) as usize, blob.len());
        assert_eq!(be32(&blob, 8), 1);
        assert_eq!(be32(&blob, 12), CSREQ_DESIGNATED);
        assert_eq!(be32(&blob, 16), 20);

        let req = &blob[20..];
        assert_eq!(be32(req, 0), CSMAGIC_REQUIREMENT);
        assert_eq!(be32(req, 4) as usize, req.len());
        assert_eq!(be32(req, 8), REQ_EXPR_FORM);
        assert_eq!(be32(req, 12), OP_AND);
        assert_eq!(be32(req, 16), OP_IDENT);
        assert_eq!(be32(req, 20), 15);
        assert_eq!(&req[24..39], b"com.example.app");
        // padded to 4
        assert_eq!(req[39], 0);
        assert_eq!(be32(req, 40), OP_AND);
        assert_eq!(be32(req, 44), OP_APPLE_GENERIC_ANCHOR);
        assert_eq!(be32(req, req.len() - 4), MATCH_EXISTS);
        assert_eq!(req.len() % 4, 0);
    }

    #[test]
    fn test_data_padding() {
        for (len, padded) in [(0, 4), (1, 8), (4, 8), (5, 12)] {
            let mut e = Expr::default();
            e.data(&vec![b'x'; len]);
            assert_eq!(e.buf.len(), padded);
        }
    }
}
