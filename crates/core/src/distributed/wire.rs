//! Binary encoding of tensors exchanged between ranks.
//!
//! A message body is laid out as:
//!
//! ```text
//! u8  op tag
//! u8  dtype code
//! u32 number of dims          (little-endian)
//! u64 dim, repeated ndims     (little-endian)
//! ..  element bytes           (little-endian, row-major)
//! ```
//!
//! Stream transports prefix every body with its `u64` little-endian length.
//! The receiver checks the op tag, dtype and shape against the collective it
//! is executing, which catches most cross-rank divergence instead of
//! silently mixing buffers.

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use super::error::{DistributedError, Result};

const HEADER_FIXED_LEN: usize = 1 + 1 + 4;

/// Collective kind carried in every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    Broadcast = 1,
    AllReduce = 2,
    Reduce = 3,
    Send = 4,
    Barrier = 5,
}

impl OpTag {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Broadcast,
            2 => Self::AllReduce,
            3 => Self::Reduce,
            4 => Self::Send,
            5 => Self::Barrier,
            other => {
                return Err(DistributedError::Transport(format!(
                    "unknown op tag {other} in frame"
                )))
            }
        })
    }
}

/// Wire code for a dtype.
#[allow(unreachable_patterns)]
pub fn dtype_code(dtype: DType) -> Result<u8> {
    match dtype {
        DType::U8 => Ok(0),
        DType::U32 => Ok(1),
        DType::I64 => Ok(2),
        DType::BF16 => Ok(3),
        DType::F16 => Ok(4),
        DType::F32 => Ok(5),
        DType::F64 => Ok(6),
        other => Err(DistributedError::UnsupportedDType(other)),
    }
}

fn dtype_from_code(code: u8) -> Result<DType> {
    Ok(match code {
        0 => DType::U8,
        1 => DType::U32,
        2 => DType::I64,
        3 => DType::BF16,
        4 => DType::F16,
        5 => DType::F32,
        6 => DType::F64,
        other => {
            return Err(DistributedError::Transport(format!(
                "unknown dtype code {other} in frame"
            )))
        }
    })
}

/// Parsed message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: OpTag,
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl FrameHeader {
    /// Split a message into its header and element bytes.
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8])> {
        if frame.len() < HEADER_FIXED_LEN {
            return Err(truncated(frame.len()));
        }
        let op = OpTag::from_u8(frame[0])?;
        let dtype = dtype_from_code(frame[1])?;
        let ndims = u32::from_le_bytes(le_array(&frame[2..6])) as usize;

        let dims_end = HEADER_FIXED_LEN + ndims * 8;
        if frame.len() < dims_end {
            return Err(truncated(frame.len()));
        }
        let dims = frame[HEADER_FIXED_LEN..dims_end]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(le_array(c)) as usize)
            .collect();

        Ok((Self { op, dtype, dims }, &frame[dims_end..]))
    }
}

fn truncated(len: usize) -> DistributedError {
    DistributedError::Transport(format!("truncated frame ({len} bytes)"))
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

macro_rules! encode_elems {
    ($tensor:expr, $buf:expr, $ty:ty) => {{
        for v in $tensor.flatten_all()?.to_vec1::<$ty>()? {
            $buf.extend_from_slice(&v.to_le_bytes());
        }
    }};
}

macro_rules! decode_elems {
    ($bytes:expr, $dims:expr, $device:expr, $ty:ty, $size:expr) => {{
        let values: Vec<$ty> = $bytes
            .chunks_exact($size)
            .map(|c| <$ty>::from_le_bytes(le_array(c)))
            .collect();
        Tensor::from_vec(values, $dims, $device)?
    }};
}

/// Encode `tensor` as a message body tagged with `op`.
#[allow(unreachable_patterns)]
pub fn encode(op: OpTag, tensor: &Tensor) -> Result<Vec<u8>> {
    let dtype = tensor.dtype();
    let code = dtype_code(dtype)?;
    let dims = tensor.dims();

    let mut buf = Vec::with_capacity(
        HEADER_FIXED_LEN + dims.len() * 8 + tensor.elem_count() * dtype.size_in_bytes(),
    );
    buf.push(op as u8);
    buf.push(code);
    buf.extend_from_slice(&(dims.len() as u32).to_le_bytes());
    for &d in dims {
        buf.extend_from_slice(&(d as u64).to_le_bytes());
    }

    match dtype {
        DType::U8 => buf.extend(tensor.flatten_all()?.to_vec1::<u8>()?),
        DType::U32 => encode_elems!(tensor, buf, u32),
        DType::I64 => encode_elems!(tensor, buf, i64),
        DType::BF16 => encode_elems!(tensor, buf, bf16),
        DType::F16 => encode_elems!(tensor, buf, f16),
        DType::F32 => encode_elems!(tensor, buf, f32),
        DType::F64 => encode_elems!(tensor, buf, f64),
        other => return Err(DistributedError::UnsupportedDType(other)),
    }
    Ok(buf)
}

/// Decode a message body, checking it against the collective in progress.
///
/// A different op tag means ranks issued different collectives; a different
/// dtype or shape means their buffers diverge.
#[allow(unreachable_patterns)]
pub fn decode(
    frame: &[u8],
    expected_op: OpTag,
    expected_dtype: DType,
    expected_dims: &[usize],
    device: &Device,
) -> Result<Tensor> {
    let (header, body) = FrameHeader::parse(frame)?;
    if header.op != expected_op {
        return Err(DistributedError::Transport(format!(
            "collective mismatch: executing {expected_op:?} but peer sent {:?}",
            header.op
        )));
    }
    if header.dtype != expected_dtype {
        return Err(DistributedError::DTypeMismatch {
            expected: expected_dtype,
            actual: header.dtype,
        });
    }
    if header.dims != expected_dims {
        return Err(DistributedError::ShapeMismatch {
            expected: expected_dims.to_vec(),
            actual: header.dims,
        });
    }

    let elem_size = header.dtype.size_in_bytes();
    let elem_count: usize = header.dims.iter().product();
    if body.len() != elem_count * elem_size {
        return Err(DistributedError::Transport(format!(
            "frame carries {} data bytes, expected {}",
            body.len(),
            elem_count * elem_size
        )));
    }

    let dims = header.dims.as_slice();
    let tensor = match header.dtype {
        DType::U8 => Tensor::from_vec(body.to_vec(), dims, device)?,
        DType::U32 => decode_elems!(body, dims, device, u32, 4),
        DType::I64 => decode_elems!(body, dims, device, i64, 8),
        DType::BF16 => decode_elems!(body, dims, device, bf16, 2),
        DType::F16 => decode_elems!(body, dims, device, f16, 2),
        DType::F32 => decode_elems!(body, dims, device, f32, 4),
        DType::F64 => decode_elems!(body, dims, device, f64, 8),
        other => return Err(DistributedError::UnsupportedDType(other)),
    };
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let t = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &Device::Cpu).unwrap();
        let frame = encode(OpTag::AllReduce, &t).unwrap();

        assert_eq!(frame[0], OpTag::AllReduce as u8);
        assert_eq!(frame[1], 5);
        assert_eq!(&frame[2..6], &2u32.to_le_bytes());
        assert_eq!(&frame[6..14], &3u64.to_le_bytes());
        assert_eq!(&frame[14..22], &2u64.to_le_bytes());
        assert_eq!(frame.len(), 22 + 6 * 4);
        assert_eq!(&frame[22..26], &1f32.to_le_bytes());
    }

    #[test]
    fn bf16_survives_transfer() {
        let t = Tensor::new(&[1.5f32, -2.25, 0.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let frame = encode(OpTag::Broadcast, &t).unwrap();
        let out = decode(&frame, OpTag::Broadcast, DType::BF16, &[3], &Device::Cpu).unwrap();
        let values: Vec<f32> = out.to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.5, -2.25, 0.0]);
    }

    #[test]
    fn scalar_tensor_has_no_dims() {
        let t = Tensor::new(7i64, &Device::Cpu).unwrap();
        let frame = encode(OpTag::Reduce, &t).unwrap();
        let (header, body) = FrameHeader::parse(&frame).unwrap();
        assert!(header.dims.is_empty());
        assert_eq!(body, &7i64.to_le_bytes());

        let out = decode(&frame, OpTag::Reduce, DType::I64, &[], &Device::Cpu).unwrap();
        assert_eq!(out.to_scalar::<i64>().unwrap(), 7);
    }

    #[test]
    fn shape_mismatch_detected() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let frame = encode(OpTag::Broadcast, &t).unwrap();
        let err = decode(&frame, OpTag::Broadcast, DType::F32, &[3, 2], &Device::Cpu).unwrap_err();
        match err {
            DistributedError::ShapeMismatch { expected, actual } => {
                assert_eq!(expected, vec![3, 2]);
                assert_eq!(actual, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dtype_mismatch_detected() {
        let t = Tensor::zeros(4, DType::F64, &Device::Cpu).unwrap();
        let frame = encode(OpTag::Broadcast, &t).unwrap();
        let err = decode(&frame, OpTag::Broadcast, DType::F32, &[4], &Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::F64
            }
        ));
    }

    #[test]
    fn op_mismatch_detected() {
        let t = Tensor::zeros(1, DType::U8, &Device::Cpu).unwrap();
        let frame = encode(OpTag::Barrier, &t).unwrap();
        let err = decode(&frame, OpTag::AllReduce, DType::U8, &[1], &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("collective mismatch"));
    }

    #[test]
    fn truncated_frames_rejected() {
        assert!(matches!(
            FrameHeader::parse(&[1, 5]),
            Err(DistributedError::Transport(_))
        ));

        let t = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let frame = encode(OpTag::Send, &t).unwrap();
        let short = &frame[..frame.len() - 1];
        assert!(decode(short, OpTag::Send, DType::F32, &[4], &Device::Cpu).is_err());
    }

    #[test]
    fn unknown_codes_rejected() {
        assert!(FrameHeader::parse(&[9, 0, 0, 0, 0, 0]).is_err());
        assert!(FrameHeader::parse(&[1, 42, 0, 0, 0, 0]).is_err());
    }
}
