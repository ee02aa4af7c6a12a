//! Wrapper-code scaffolding.
//!
//! Copies the runtime's service wrapper template into a build directory,
//! producing a buildable project there. The template filesystem is
//! read-only input laid out as `<templates>/<runtime>/scaffolding/<invoke>`.

use std::fs;
use std::path::Path;

use funcforge_core::{BuildError, Result};

/// Invocation hint assumed when the function declares none.
const DEFAULT_INVOKE: &str = "http";

/// Materialize wrapper code for `runtime` into `dest`.
///
/// For Go the template lands in the build directory itself (the compiler
/// runs there); the template's module file is rewritten to resolve the
/// function package `f` from `source`. For other runtimes the template
/// lands under `dest/service`.
pub fn write(dest: &Path, source: &Path, runtime: &str, invoke: &str, templates: &Path) -> Result<()> {
    let invoke = if invoke.is_empty() { DEFAULT_INVOKE } else { invoke };
    let template = templates.join(runtime).join("scaffolding").join(invoke);
    if !template.is_dir() {
        return Err(BuildError::Scaffold(format!(
            "no {} scaffolding for '{}' invocation at {}",
            runtime,
            invoke,
            template.display()
        )));
    }

    let target = match runtime {
        "go" => dest.to_path_buf(),
        _ => dest.join("service"),
    };
    copy_dir_recursive(&template, &target)?;

    if runtime == "go" {
        write_module_file(&target, source)?;
    }
    Ok(())
}

/// Write a module file resolving the scaffolded wrapper's `f` dependency
/// to the function source on disk.
fn write_module_file(dest: &Path, source: &Path) -> Result<()> {
    let contents = format!(
        "module function\n\ngo 1.21\n\nrequire f v0.0.0\n\nreplace f => {}\n",
        source.display()
    );
    fs::write(dest.join("go.mod"), contents)
        .map_err(|e| BuildError::Scaffold(format!("cannot write module file: {}", e)))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .map_err(|e| BuildError::Scaffold(format!("cannot create {}: {}", dst.display(), e)))?;

    let entries = fs::read_dir(src)
        .map_err(|e| BuildError::Scaffold(format!("cannot read {}: {}", src.display(), e)))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| BuildError::Scaffold(format!("cannot read entry: {}", e)))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| {
                BuildError::Scaffold(format!(
                    "cannot copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}
