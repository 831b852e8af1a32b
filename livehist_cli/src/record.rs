use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use liblivehist::error::UnpackError;
use liblivehist::event::EventCode;
use liblivehist::impl_record;

pub const PHYSICS_EVENT: EventCode = 1;
pub const SCALER_EVENT: EventCode = 2;

pub const N_ADC: usize = 16;
/// timestamp, adcs, tdcs and the hit count
const PHYSICS_FIXED_BYTES: usize = 8 + 2 * N_ADC + 2 * 8 + 1;
const SCALER_BYTES: usize = 4 * 4;

/// The physics event of the bundled example:
///
/// ```text
/// [u64 timestamp][16 x u16 adc][2 x 4 x u16 tdc][u8 n][n x f32 hits]
/// ```
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Physics {
    pub timestamp: u64,
    pub adc: [u16; N_ADC],
    pub tdc: [[u16; 4]; 2],
    pub multiplicity: u8,
    pub hits: Vec<f32>,
}
impl_record!(Physics {
    timestamp,
    adc,
    tdc,
    multiplicity,
    hits
});

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Scalers {
    pub counts: [u32; 4],
}
impl_record!(Scalers { counts });

fn short(needed: usize, found: usize) -> UnpackError {
    UnpackError::ShortBuffer { needed, found }
}

pub fn unpack_physics(raw: &[u8], record: &mut Physics) -> Result<(), UnpackError> {
    if raw.len() < PHYSICS_FIXED_BYTES {
        return Err(short(PHYSICS_FIXED_BYTES, raw.len()));
    }
    let n_hits = raw[PHYSICS_FIXED_BYTES - 1] as usize;
    let needed = PHYSICS_FIXED_BYTES + 4 * n_hits;
    if raw.len() < needed {
        return Err(short(needed, raw.len()));
    }

    let fail = |e: std::io::Error| UnpackError::BadEvent(e.to_string());
    let mut cursor = Cursor::new(raw);
    record.timestamp = cursor.read_u64::<LittleEndian>().map_err(fail)?;
    cursor
        .read_u16_into::<LittleEndian>(&mut record.adc)
        .map_err(fail)?;
    for row in record.tdc.iter_mut() {
        cursor.read_u16_into::<LittleEndian>(row).map_err(fail)?;
    }
    record.multiplicity = cursor.read_u8().map_err(fail)?;
    record.hits.clear();
    for _ in 0..n_hits {
        record.hits.push(cursor.read_f32::<LittleEndian>().map_err(fail)?);
    }
    Ok(())
}

pub fn unpack_scalers(raw: &[u8], record: &mut Scalers) -> Result<(), UnpackError> {
    if raw.len() < SCALER_BYTES {
        return Err(short(SCALER_BYTES, raw.len()));
    }
    Cursor::new(raw)
        .read_u32_into::<LittleEndian>(&mut record.counts)
        .map_err(|e| UnpackError::BadEvent(e.to_string()))
}

/// Inverse of [`unpack_physics`], used to generate demo data
pub fn pack_physics(record: &Physics) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(PHYSICS_FIXED_BYTES + 4 * record.hits.len());
    bytes.write_u64::<LittleEndian>(record.timestamp)?;
    for value in record.adc.iter().chain(record.tdc.iter().flatten()) {
        bytes.write_u16::<LittleEndian>(*value)?;
    }
    bytes.write_u8(record.hits.len().min(u8::MAX as usize) as u8)?;
    for hit in record.hits.iter().take(u8::MAX as usize) {
        bytes.write_f32::<LittleEndian>(*hit)?;
    }
    Ok(bytes)
}

pub fn pack_scalers(record: &Scalers) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(SCALER_BYTES);
    for count in record.counts {
        bytes.write_u32::<LittleEndian>(count)?;
    }
    Ok(bytes)
}

/// A deterministic synthetic physics event
pub fn synthetic_physics(n: u64) -> Physics {
    let mut record = Physics {
        timestamp: n * 1000,
        ..Default::default()
    };
    for (i, adc) in record.adc.iter_mut().enumerate() {
        *adc = ((n * 37 + i as u64 * 211) % 4096) as u16;
    }
    for (i, tdc) in record.tdc.iter_mut().flatten().enumerate() {
        *tdc = ((n * 13 + i as u64 * 97) % 1024) as u16;
    }
    record.multiplicity = (n % 5) as u8;
    record.hits = (0..record.multiplicity)
        .map(|i| ((n % 100) as f32) * 0.5 + i as f32)
        .collect();
    record
}
