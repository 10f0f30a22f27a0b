//! The tiled backend's shader bytecode format.
//!
//! Bytecode is opaque at the API boundary and backend-defined. This backend
//! accepts a small tagged container: graphics programs are markers (the
//! in-process driver validates draw state but does not rasterize), compute
//! programs are built-ins with real memory effects so dispatch results can be
//! observed through readback.

/// 4-byte magic prefix of every accepted blob.
pub const MAGIC: &[u8; 4] = b"EMBR";

const KIND_VERTEX: u8 = 0;
const KIND_FRAGMENT: u8 = 1;
const KIND_COMPUTE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VertexProgram {
    Passthrough,
    FullscreenTriangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragmentProgram {
    SolidColor,
    BlitFrom2D,
    BlitFrom2DArray,
    BlitFrom3D,
    BlitFromCube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComputeProgram {
    /// Each invocation stores its global index as a `u32` at `4 * index`
    /// into read-write storage buffer slot 0, bounds-checked.
    StoreGlobalIndex,
    /// Fills read-write storage buffer slot 0 with a constant word.
    FillWord(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShaderProgram {
    Vertex(VertexProgram),
    Fragment(FragmentProgram),
    Compute(ComputeProgram),
}

pub(crate) fn parse(bytecode: &[u8]) -> Result<ShaderProgram, String> {
    if bytecode.len() < 6 {
        return Err("blob shorter than the 6-byte header".into());
    }
    if &bytecode[0..4] != MAGIC {
        return Err("missing EMBR magic".into());
    }
    let kind = bytecode[4];
    let tag = bytecode[5];
    match kind {
        KIND_VERTEX => match tag {
            0 => Ok(ShaderProgram::Vertex(VertexProgram::Passthrough)),
            1 => Ok(ShaderProgram::Vertex(VertexProgram::FullscreenTriangle)),
            _ => Err(format!("unknown vertex program tag {tag}")),
        },
        KIND_FRAGMENT => match tag {
            0 => Ok(ShaderProgram::Fragment(FragmentProgram::SolidColor)),
            1 => Ok(ShaderProgram::Fragment(FragmentProgram::BlitFrom2D)),
            2 => Ok(ShaderProgram::Fragment(FragmentProgram::BlitFrom2DArray)),
            3 => Ok(ShaderProgram::Fragment(FragmentProgram::BlitFrom3D)),
            4 => Ok(ShaderProgram::Fragment(FragmentProgram::BlitFromCube)),
            _ => Err(format!("unknown fragment program tag {tag}")),
        },
        KIND_COMPUTE => match tag {
            0 => Ok(ShaderProgram::Compute(ComputeProgram::StoreGlobalIndex)),
            1 => {
                if bytecode.len() < 10 {
                    return Err("FillWord program is missing its operand".into());
                }
                let word = u32::from_le_bytes([bytecode[6], bytecode[7], bytecode[8], bytecode[9]]);
                Ok(ShaderProgram::Compute(ComputeProgram::FillWord(word)))
            }
            _ => Err(format!("unknown compute program tag {tag}")),
        },
        _ => Err(format!("unknown shader kind {kind}")),
    }
}

fn blob(kind: u8, tag: u8, operand: Option<u32>) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(MAGIC);
    out.push(kind);
    out.push(tag);
    if let Some(word) = operand {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Authoring helpers for the tiled backend's blobs. Exposed publicly as
/// [`crate::tiled::bytecode`].
pub mod authoring {
    use super::*;

    pub fn vertex_passthrough() -> Vec<u8> {
        blob(KIND_VERTEX, 0, None)
    }

    pub fn vertex_fullscreen_triangle() -> Vec<u8> {
        blob(KIND_VERTEX, 1, None)
    }

    pub fn fragment_solid_color() -> Vec<u8> {
        blob(KIND_FRAGMENT, 0, None)
    }

    pub fn fragment_blit_from_2d() -> Vec<u8> {
        blob(KIND_FRAGMENT, 1, None)
    }

    pub fn fragment_blit_from_2d_array() -> Vec<u8> {
        blob(KIND_FRAGMENT, 2, None)
    }

    pub fn fragment_blit_from_3d() -> Vec<u8> {
        blob(KIND_FRAGMENT, 3, None)
    }

    pub fn fragment_blit_from_cube() -> Vec<u8> {
        blob(KIND_FRAGMENT, 4, None)
    }

    pub fn compute_store_global_index() -> Vec<u8> {
        blob(KIND_COMPUTE, 0, None)
    }

    pub fn compute_fill_word(word: u32) -> Vec<u8> {
        blob(KIND_COMPUTE, 1, Some(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_authored_program() {
        assert_eq!(
            parse(&authoring::vertex_fullscreen_triangle()).unwrap(),
            ShaderProgram::Vertex(VertexProgram::FullscreenTriangle)
        );
        assert_eq!(
            parse(&authoring::fragment_blit_from_cube()).unwrap(),
            ShaderProgram::Fragment(FragmentProgram::BlitFromCube)
        );
        assert_eq!(
            parse(&authoring::compute_fill_word(0xdead_beef)).unwrap(),
            ShaderProgram::Compute(ComputeProgram::FillWord(0xdead_beef))
        );
    }

    #[test]
    fn rejects_foreign_blobs() {
        assert!(parse(b"DXBC\x00\x00\x00\x00").is_err());
        assert!(parse(&[]).is_err());
        assert!(parse(b"EMBR\x07\x00").is_err());
    }
}
