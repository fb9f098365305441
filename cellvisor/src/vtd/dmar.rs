//! ACPI DMA Remapping Reporting table.

use crate::VmError;
use alloc::vec::Vec;

/// Size of the table header including the DMAR specific fields.
pub const HEADER_LEN: usize = 48;
/// Size of a hardware unit definition without its device scopes.
pub const DRHD_LEN: usize = 16;

const TYPE_DRHD: u16 = 0;

/// DMA remapping hardware unit definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drhd {
    pub flags: u8,
    pub segment: u16,
    pub register_base: u64,
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

/// The hardware units listed at the start of the table.
///
/// Units must come first; the walk ends at the first record of another type
/// or at the end of the table. Only PCI segment 0 is supported.
pub fn parse(table: &[u8]) -> Result<Vec<Drhd>, VmError> {
    if table.len() < 8 {
        return Err(VmError::FirmwareTable("truncated DMAR"));
    }
    let length = u32::from_le_bytes([table[4], table[5], table[6], table[7]]) as usize;
    if HEADER_LEN + DRHD_LEN > length || length > table.len() {
        return Err(VmError::FirmwareTable("DMAR too short"));
    }
    let table = &table[..length];
    if u16_at(table, HEADER_LEN) != TYPE_DRHD {
        return Err(VmError::FirmwareTable("DMAR does not start with a unit"));
    }

    let mut units = Vec::new();
    let mut offset = HEADER_LEN;
    loop {
        let record_len = u16_at(table, offset + 2) as usize;
        if record_len < DRHD_LEN || offset + record_len > length {
            return Err(VmError::FirmwareTable("bad DRHD length"));
        }
        let record = &table[offset..offset + record_len];
        let segment = u16_at(record, 6);
        if segment != 0 {
            return Err(VmError::FirmwareTable("PCI segment other than 0"));
        }
        let mut base = [0; 8];
        base.copy_from_slice(&record[8..16]);
        units.push(Drhd {
            flags: record[4],
            segment,
            register_base: u64::from_le_bytes(base),
        });

        offset += record_len;
        if offset + 4 > length || u16_at(table, offset) != TYPE_DRHD {
            break;
        }
    }
    Ok(units)
}

/// Build a table out of units and trailing records. For tests and
/// emulated platforms.
pub fn build(units: &[Drhd], trailer: &[u8]) -> Vec<u8> {
    let mut table = Vec::new();
    table.extend_from_slice(b"DMAR");
    table.extend_from_slice(&[0; HEADER_LEN - 4]);
    for unit in units {
        table.extend_from_slice(&TYPE_DRHD.to_le_bytes());
        table.extend_from_slice(&(DRHD_LEN as u16).to_le_bytes());
        table.push(unit.flags);
        table.push(0);
        table.extend_from_slice(&unit.segment.to_le_bytes());
        table.extend_from_slice(&unit.register_base.to_le_bytes());
    }
    table.extend_from_slice(trailer);
    let len = (table.len() as u32).to_le_bytes();
    table[4..8].copy_from_slice(&len);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(base: u64) -> Drhd {
        Drhd {
            flags: 0,
            segment: 0,
            register_base: base,
        }
    }

    #[test]
    fn units_until_other_record() {
        // A reserved memory region record ends the walk.
        let rmrr = [1, 0, 8, 0, 0, 0, 0, 0];
        let table = build(&[unit(0xfed9_0000), unit(0xfed9_1000)], &rmrr);
        assert_eq!(
            parse(&table),
            Ok(alloc::vec![unit(0xfed9_0000), unit(0xfed9_1000)])
        );
    }

    #[test]
    fn malformed_tables() {
        assert!(parse(&build(&[], &[])).is_err());
        assert!(parse(&build(&[], &[1, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])).is_err());

        let mut bad_segment = unit(0xfed9_0000);
        bad_segment.segment = 1;
        assert_eq!(
            parse(&build(&[bad_segment], &[])),
            Err(VmError::FirmwareTable("PCI segment other than 0"))
        );

        let mut short = build(&[unit(0xfed9_0000)], &[]);
        short[HEADER_LEN + 2] = 8;
        assert_eq!(parse(&short), Err(VmError::FirmwareTable("bad DRHD length")));

        let mut overlong = build(&[unit(0xfed9_0000)], &[]);
        overlong[HEADER_LEN + 2] = 32;
        assert_eq!(parse(&overlong), Err(VmError::FirmwareTable("bad DRHD length")));
    }
}
