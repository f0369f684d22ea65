//! KernelLowering: turns offloaded kernels into backend source text.
//!
//! - `CLowering` emits one C function per kernel for the transpile backend
//! - `WgslLowering` emits one WGSL module per kernel, one entry point per task
//!
//! Both consume the typed task IR from `ir::offload`, so they never fail:
//! every semantic check has already happened.

mod c;
mod wgsl;

use crate::config::Arch;
use crate::ir::offload::OffloadedKernel;
use crate::runtime::ArgumentLayout;

pub use c::{field_macro, CLowering};
pub use wgsl::{bindings, Binding, WgslLowering, RANGE_WORKGROUP_SIZE};

/// Lowers one offloaded kernel into source text.
pub trait KernelLowering: Send + Sync {
    /// The target name (e.g. "c", "wgsl").
    fn target_name(&self) -> &str;

    /// Lower a kernel whose scalar arguments are packed per `args`.
    fn lower(&self, kernel: &OffloadedKernel, args: &ArgumentLayout) -> String;
}

/// Create the lowering used by the given backend.
pub fn create_kernel_lowering(arch: Arch) -> Box<dyn KernelLowering> {
    match arch {
        Arch::Cc => Box::new(CLowering::new()),
        Arch::Gfx => Box::new(WgslLowering::new()),
    }
}

/// Line-oriented source writer with indentation.
pub(crate) struct SourceWriter {
    lines: Vec<String>,
    indent: usize,
}

impl SourceWriter {
    pub(crate) fn new() -> Self {
        Self {
            lines: Vec::new(),
            indent: 0,
        }
    }

    pub(crate) fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            self.lines.push(String::new());
        } else {
            self.lines
                .push(format!("{}{}", "    ".repeat(self.indent), text));
        }
    }

    /// Emit `header {`, run `body` one level deeper, then `}`.
    pub(crate) fn block(&mut self, header: impl AsRef<str>, body: impl FnOnce(&mut Self)) {
        match header.as_ref() {
            "" => self.line("{"),
            header => self.line(format!("{} {{", header)),
        }
        self.indent += 1;
        body(self);
        self.indent -= 1;
        self.line("}");
    }

    pub(crate) fn finish(self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests;
