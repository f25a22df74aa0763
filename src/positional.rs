//! Fixed sinusoidal positional encoding.
//!
//! The table is computed once on the host and uploaded as a constant tensor.
//! It holds no learned state and is not part of the parameter map, so it never
//! appears in checkpoints.

use candle_core::{DType, Device, Result, Tensor};

/// Sinusoidal position table of shape `(max_len, d_model)`.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Tensor,
    max_len: usize,
    d_model: usize,
}

/// Build the raw table row by row.
///
/// Even channel `i` holds `sin(pos / 10000^(i / d_model))` and the following
/// odd channel holds the matching cosine. With an odd `d_model` the last
/// channel keeps its sine.
pub fn sinusoidal_table(max_len: usize, d_model: usize) -> Vec<f32> {
    let mut table = vec![0f32; max_len * d_model];
    for pos in 0..max_len {
        let row = &mut table[pos * d_model..(pos + 1) * d_model];
        for i in (0..d_model).step_by(2) {
            let angle = pos as f64 / 10000f64.powf(i as f64 / d_model as f64);
            row[i] = angle.sin() as f32;
            if i + 1 < d_model {
                row[i + 1] = angle.cos() as f32;
            }
        }
    }
    table
}

impl PositionalEncoding {
    /// Create the encoding for sequences of up to `max_len` positions.
    pub fn new(d_model: usize, max_len: usize, device: &Device) -> Result<Self> {
        let table = Tensor::from_vec(sinusoidal_table(max_len, d_model), (max_len, d_model), device)?;
        Ok(Self {
            table,
            max_len,
            d_model,
        })
    }

    /// The full `(max_len, d_model)` table.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Host copy of the table, one row per position.
    pub fn values(&self) -> Result<Vec<Vec<f32>>> {
        self.table.to_vec2::<f32>()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Add the encoding to a `(batch, seq_len, d_model)` sequence.
    ///
    /// Sequences shorter than `max_len` use the leading rows of the table.
    pub fn add_to(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq_len, d_model) = x.dims3()?;
        if seq_len > self.max_len || d_model != self.d_model {
            candle_core::bail!(
                "positional encoding is ({}, {}), input sequence is ({seq_len}, {d_model})",
                self.max_len,
                self.d_model
            );
        }
        let pe = self.table.narrow(0, 0, seq_len)?;
        let pe = if x.dtype() == DType::F32 {
            pe
        } else {
            pe.to_dtype(x.dtype())?
        };
        x.broadcast_add(&pe.unsqueeze(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        let pe = PositionalEncoding::new(32, 197, &Device::Cpu).unwrap();
        assert_eq!(pe.table().dims(), &[197, 32]);
    }

    #[test]
    fn test_table_matches_formula() {
        let d_model = 16;
        let pe = PositionalEncoding::new(d_model, 10, &Device::Cpu).unwrap();
        let rows = pe.values().unwrap();

        for (p, row) in rows.iter().enumerate() {
            for k in 0..d_model / 2 {
                let angle = p as f64 / 10000f64.powf((2 * k) as f64 / d_model as f64);
                assert!((row[2 * k] as f64 - angle.sin()).abs() < 1e-5);
                assert!((row[2 * k + 1] as f64 - angle.cos()).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_position_zero() {
        let table = sinusoidal_table(1, 8);
        assert_eq!(table, vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_odd_d_model_keeps_last_sine() {
        let d_model = 5;
        let table = sinusoidal_table(4, d_model);
        assert_eq!(table.len(), 4 * d_model);

        let p = 3.0f64;
        let angle = p / 10000f64.powf(4.0 / d_model as f64);
        let last = table[3 * d_model + 4] as f64;
        assert!((last - angle.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_add_to_broadcasts_over_batch() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 6, &device).unwrap();
        let x = Tensor::zeros((3, 6, 8), DType::F32, &device).unwrap();
        let out = pe.add_to(&x).unwrap();
        assert_eq!(out.dims(), &[3, 6, 8]);

        let first = out.get(0).unwrap().to_vec2::<f32>().unwrap();
        let last = out.get(2).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first, last);
        assert_eq!(first, pe.table().to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_add_to_rejects_long_sequence() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 4, &device).unwrap();
        let x = Tensor::zeros((1, 5, 8), DType::F32, &device).unwrap();
        assert!(pe.add_to(&x).is_err());
    }
}
