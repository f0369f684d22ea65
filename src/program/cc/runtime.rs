//! Runtime support for transpiled modules: the helper routines every
//! kernel calls, the per-session layout constants and the context struct
//! shared with generated code.

use std::fmt::Write;

use crate::lower::field_macro;
use crate::runtime::{MAX_ARGS, MAX_RETURNS, MAX_TREES};
use crate::snode::Layouts;

/// Context handed to every kernel entry point. Mirrors `WeftContext` in
/// `RUNTIME_SUPPORT` field for field.
#[repr(C)]
pub struct WeftContext {
    pub args: *mut u8,
    pub roots: [*mut u8; MAX_TREES],
    pub gtmp: *mut u8,
    pub rets: [u32; MAX_RETURNS],
    /// Element count of each ndarray argument, by parameter position.
    pub nd_len: [u32; MAX_ARGS],
    /// Set by generated code when an index falls outside its field or ndarray.
    pub fault: u32,
}

// SAFETY: every pointer targets an arena owned by the same `CcState`, and
// the context is only read or handed to generated code while that state's
// mutex is held.
unsafe impl Send for WeftContext {}

impl WeftContext {
    pub fn new() -> Self {
        Self {
            args: std::ptr::null_mut(),
            roots: [std::ptr::null_mut(); MAX_TREES],
            gtmp: std::ptr::null_mut(),
            rets: [0; MAX_RETURNS],
            nd_len: [0; MAX_ARGS],
            fault: 0,
        }
    }
}

impl Default for WeftContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Signature of every exported kernel.
pub type KernelEntry = unsafe extern "C" fn(*mut WeftContext);

/// Helper routines prepended to every translation unit.
///
/// Integer division and remainder follow WGSL: division by zero yields
/// the dividend, remainder by zero yields 0, and `INT32_MIN / -1` does
/// not trap. Float to integer conversion saturates and maps NaN to 0.
/// Field and ndarray accesses are bounds checked: an out-of-range load
/// reads 0, an out-of-range store is dropped, and both raise `fault`.
pub const RUNTIME_SUPPORT: &str = r#"#include <stdint.h>
#include <stddef.h>
#include <string.h>
#include <math.h>

#if defined(_WIN32)
#define WEFT_EXPORT __declspec(dllexport)
#else
#define WEFT_EXPORT __attribute__((visibility("default")))
#endif

typedef struct WeftContext {
    uint8_t *args;
    uint8_t *roots[32];
    uint8_t *gtmp;
    uint32_t rets[16];
    uint32_t nd_len[64];
    uint32_t fault;
} WeftContext;

static inline int32_t weft_ld_i32(const uint8_t *p) { int32_t v; memcpy(&v, p, 4); return v; }
static inline uint32_t weft_ld_u32(const uint8_t *p) { uint32_t v; memcpy(&v, p, 4); return v; }
static inline float weft_ld_f32(const uint8_t *p) { float v; memcpy(&v, p, 4); return v; }
static inline void weft_st_i32(uint8_t *p, int32_t v) { memcpy(p, &v, 4); }
static inline void weft_st_u32(uint8_t *p, uint32_t v) { memcpy(p, &v, 4); }
static inline void weft_st_f32(uint8_t *p, float v) { memcpy(p, &v, 4); }

static inline float weft_f32(uint32_t bits) { float v; memcpy(&v, &bits, 4); return v; }
static inline uint32_t weft_bits_i32(int32_t v) { return (uint32_t)v; }
static inline uint32_t weft_bits_u32(uint32_t v) { return v; }
static inline uint32_t weft_bits_f32(float v) { uint32_t b; memcpy(&b, &v, 4); return b; }
static inline uint8_t *weft_ptr(const uint8_t *p) { uint8_t *v; memcpy(&v, p, sizeof v); return v; }

static inline uint8_t *weft_nd_at(WeftContext *ctx, size_t slot, uint32_t arg, int32_t i) {
    if ((uint32_t)i >= ctx->nd_len[arg]) { ctx->fault = 1; return NULL; }
    return weft_ptr(ctx->args + slot) + (size_t)(uint32_t)i * 4;
}
static inline uint8_t *weft_at(WeftContext *ctx, uint8_t *base, int rank, const int32_t *idx,
                               const uint32_t *extent, const size_t *stride) {
    size_t off = 0;
    for (int k = 0; k < rank; ++k) {
        if ((uint32_t)idx[k] >= extent[k]) { ctx->fault = 1; return NULL; }
        off += (size_t)(uint32_t)idx[k] * stride[k];
    }
    return base + off;
}
static inline int32_t weft_ldp_i32(const uint8_t *p) { return p ? weft_ld_i32(p) : 0; }
static inline uint32_t weft_ldp_u32(const uint8_t *p) { return p ? weft_ld_u32(p) : 0u; }
static inline float weft_ldp_f32(const uint8_t *p) { return p ? weft_ld_f32(p) : 0.0f; }
static inline void weft_stp_i32(uint8_t *p, int32_t v) { if (p) weft_st_i32(p, v); }
static inline void weft_stp_u32(uint8_t *p, uint32_t v) { if (p) weft_st_u32(p, v); }
static inline void weft_stp_f32(uint8_t *p, float v) { if (p) weft_st_f32(p, v); }

static inline int32_t weft_div_i32(int32_t a, int32_t b) {
    if (b == 0 || (a == INT32_MIN && b == -1)) return a;
    return a / b;
}
static inline int32_t weft_rem_i32(int32_t a, int32_t b) {
    if (b == 0 || (a == INT32_MIN && b == -1)) return 0;
    return a % b;
}
static inline uint32_t weft_div_u32(uint32_t a, uint32_t b) { return b == 0 ? a : a / b; }
static inline uint32_t weft_rem_u32(uint32_t a, uint32_t b) { return b == 0 ? 0 : a % b; }

static inline int32_t weft_min_i32(int32_t a, int32_t b) { return a < b ? a : b; }
static inline int32_t weft_max_i32(int32_t a, int32_t b) { return a > b ? a : b; }
static inline uint32_t weft_min_u32(uint32_t a, uint32_t b) { return a < b ? a : b; }
static inline uint32_t weft_max_u32(uint32_t a, uint32_t b) { return a > b ? a : b; }
static inline float weft_min_f32(float a, float b) { return fminf(a, b); }
static inline float weft_max_f32(float a, float b) { return fmaxf(a, b); }
static inline int32_t weft_abs_i32(int32_t a) { return (a < 0 && a != INT32_MIN) ? -a : a; }

static inline int32_t weft_f32_to_i32(float v) {
    if (v != v) return 0;
    if (v <= -2147483648.0f) return INT32_MIN;
    if (v >= 2147483648.0f) return INT32_MAX;
    return (int32_t)v;
}
static inline uint32_t weft_f32_to_u32(float v) {
    if (v != v || v <= 0.0f) return 0;
    if (v >= 4294967296.0f) return UINT32_MAX;
    return (uint32_t)v;
}
"#;

/// `#define`s for the global-temporary size and every place of every
/// materialized tree, in tree then node order.
pub fn layout_constants(layouts: &Layouts, gtmp_bytes: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "/* layout: {} tree(s) */", layouts.len());
    let _ = writeln!(out, "#define WEFT_GTMP_SIZE {}", gtmp_bytes);
    for (tree, layout) in layouts {
        let _ = writeln!(out, "#define WEFT_T{}_SIZE {}", tree.0, layout.size);
        for field in layout.fields.values() {
            let m = field_macro(field.snode);
            let _ = writeln!(out, "#define {}_OFF {}", m, field.offset);
            for (k, axis) in field.axes.iter().enumerate() {
                let _ = writeln!(out, "#define {}_D{} {}", m, k, axis.extent);
                let _ = writeln!(out, "#define {}_S{} {}", m, k, axis.stride);
            }
        }
    }
    out
}

/// The combined unit: runtime support, layout constants, then every
/// kernel in registration order.
pub fn translation_unit<'a>(
    layouts: &Layouts,
    gtmp_bytes: usize,
    kernels: impl IntoIterator<Item = &'a str>,
) -> String {
    let mut out = String::from(RUNTIME_SUPPORT);
    out.push('\n');
    out.push_str(&layout_constants(layouts, gtmp_bytes));
    for source in kernels {
        out.push('\n');
        out.push_str(source);
    }
    out
}
