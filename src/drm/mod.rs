//! Wire types for the DRM helper subprocess. The helper owns the KMS
//! plane-walking; we only speak its socket protocol.

pub mod messaging;

pub const MAX_PLANE_DESCRIPTORS: usize = 8;

/// Rendezvous point between the recorder and the helper.
pub const SOCKET_PATH: &str = "/tmp/shadow-cast.sock";

/// Helper binary, expected next to the main executable.
pub const HELPER_BINARY: &str = "shadow-cast-kms";

pub mod request {
    pub const GET_PLANES: u32 = 1;
    pub const STOP: u32 = 2;
}

pub mod plane_flags {
    pub const IS_CURSOR: u32 = 1 << 0;
    pub const IS_COMBINED: u32 = 1 << 1;
}

/// One scan-out plane, including the dma-buf fd delivered via SCM_RIGHTS.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneDescriptor {
    pub fd: i32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub offset: u32,
    pub pixel_format: u32,
    pub modifier: u64,
    pub connector_id: u32,
    pub flags: u32,
    pub x: i32,
    pub y: i32,
    pub src_w: i32,
    pub src_h: i32,
}

impl PlaneDescriptor {
    pub fn is_flag_set(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DrmRequest {
    pub kind: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmResponse {
    pub result: u32,
    pub num_fds: u32,
    pub descriptors: [PlaneDescriptor; MAX_PLANE_DESCRIPTORS],
}

#[cfg(test)]
mod tests {
    use super::*;

    // The helper is a separate C-ABI process; the structs must keep their
    // wire layout
    #[test]
    fn wire_structs_have_their_c_layout() {
        assert_eq!(std::mem::size_of::<DrmRequest>(), 4);
        assert_eq!(std::mem::size_of::<PlaneDescriptor>(), 56);
        assert_eq!(
            std::mem::size_of::<DrmResponse>(),
            8 + MAX_PLANE_DESCRIPTORS * 56
        );
    }

    #[test]
    fn plane_flags_are_independent_bits() {
        let plane = PlaneDescriptor {
            flags: plane_flags::IS_CURSOR,
            ..Default::default()
        };
        assert!(plane.is_flag_set(plane_flags::IS_CURSOR));
        assert!(!plane.is_flag_set(plane_flags::IS_COMBINED));
    }
}
