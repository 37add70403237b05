//! Syscall argument squashing.

use crate::ir::{IrEmitter, IrOp, NodeId};
use crate::passes::{Pass, PassError};

/// For syscalls with a constant number, drops argument references beyond
/// what the syscall actually reads; the freed definitions fall to the next
/// DCE run and shrink register pressure around the call.
#[derive(Debug, Default)]
pub struct SyscallOpt;

/// Argument counts for the common guest syscalls; anything unknown keeps
/// its full argument list.
fn syscall_arg_count(nr: u64) -> Option<u8> {
    Some(match nr {
        0 | 1 => 3,        // read, write
        2 => 3,            // open
        3 => 1,            // close
        9 => 6,            // mmap
        11 => 2,           // munmap
        39 => 0,           // getpid
        60 | 231 => 1,     // exit, exit_group
        _ => return None,
    })
}

impl Pass for SyscallOpt {
    fn name(&self) -> &'static str {
        "SyscallOptimization"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;

        let code: Vec<NodeId> = ir.view().all_code().collect();
        for id in code {
            if ir.view().is_dead(id) {
                continue;
            }
            let IrOp::Syscall { args, arg_count } = *ir.view().op(id) else {
                continue;
            };
            let IrOp::Constant { value: nr } = *ir.view().op(args[0]) else {
                continue;
            };
            let Some(needed) = syscall_arg_count(nr) else {
                continue;
            };
            // Number plus its payload arguments.
            let wanted = needed + 1;
            if arg_count > wanted {
                if let IrOp::Syscall { arg_count: c, .. } = ir.op_mut(id) {
                    *c = wanted;
                }
                changed = true;
            }
        }

        Ok(changed)
    }
}
