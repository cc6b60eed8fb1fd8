use std::{
    env,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const APP: &str = "tritex-app";

// ----------------------------------------------------------------
// Entry point
// ----------------------------------------------------------------

fn main() {
    if let Err(e) = try_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    match env::args().nth(1).as_deref() {
        Some(task) => execute_graph(task),
        None => {
            eprintln!("Usage: cargo xtask <task>\n");
            eprintln!("Tasks:");
            for task in &all_tasks() {
                eprintln!("  {:<16} {}", task.name, task.about);
            }
            std::process::exit(1);
        }
    }
}

// ----------------------------------------------------------------
// Task graph
// ----------------------------------------------------------------

struct Task {
    name: &'static str,
    about: &'static str,
    deps: &'static [&'static str],
    run: fn() -> Result<()>,
}

fn noop() -> Result<()> {
    Ok(())
}

fn all_tasks() -> Vec<Task> {
    vec![
        Task {
            name: "cargo-build",
            about: "build the app in debug mode",
            deps: &[],
            run: cargo_build,
        },
        Task {
            name: "compile-shaders",
            about: "compile shaders/*.slang to SPIR-V with slangc",
            deps: &[],
            run: compile_shaders,
        },
        Task {
            name: "copy-exe",
            about: "stage the executable beside the shaders",
            deps: &["cargo-build"],
            run: copy_exe,
        },
        Task {
            name: "build",
            about: "everything needed to run from out/",
            deps: &["cargo-build", "compile-shaders", "copy-exe"],
            run: noop,
        },
        Task {
            name: "run",
            about: "build, then run the staged app (args after `--`)",
            deps: &["build"],
            run: run_app,
        },
        Task {
            name: "clean",
            about: "remove the staging directory",
            deps: &[],
            run: clean,
        },
    ]
}

#[derive(Clone, Copy, PartialEq)]
enum Status {
    Succeeded,
    Failed,
    Skipped,
}

fn task_index(tasks: &[Task], name: &str) -> Result<usize> {
    tasks
        .iter()
        .position(|t| t.name == name)
        .ok_or_else(|| format!("unknown task: `{name}`").into())
}

fn collect_topo(
    tasks: &[Task],
    name: &str,
    visited: &mut Vec<bool>,
    order: &mut Vec<usize>,
) -> Result<()> {
    let idx = task_index(tasks, name)?;
    if visited[idx] {
        return Ok(());
    }
    visited[idx] = true;
    let deps = tasks[idx].deps;
    for &dep in deps {
        collect_topo(tasks, dep, visited, order)?;
    }
    order.push(idx);
    Ok(())
}

fn execute_graph(target: &str) -> Result<()> {
    let tasks = all_tasks();
    let mut visited = vec![false; tasks.len()];
    let mut order: Vec<usize> = Vec::new();
    collect_topo(&tasks, target, &mut visited, &mut order)?;

    let mut statuses: Vec<Option<Status>> = vec![None; tasks.len()];

    for &idx in &order {
        let task = &tasks[idx];
        let blocked = task.deps.iter().any(|&dep| {
            let dep_idx = tasks.iter().position(|t| t.name == dep).unwrap();
            matches!(statuses[dep_idx], Some(Status::Failed | Status::Skipped))
        });

        if blocked {
            eprintln!("skip: {}", task.name);
            statuses[idx] = Some(Status::Skipped);
            continue;
        }

        match (task.run)() {
            Ok(()) => statuses[idx] = Some(Status::Succeeded),
            Err(e) => {
                eprintln!("failed: {}: {e}", task.name);
                statuses[idx] = Some(Status::Failed);
            }
        }
    }

    let failed: Vec<&str> = order
        .iter()
        .filter(|&&i| statuses[i] == Some(Status::Failed))
        .map(|&i| tasks[i].name)
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(
            format!("{} task(s) failed: {}", failed.len(), failed.join(", "))
                .into(),
        )
    }
}

// ----------------------------------------------------------------
// Task implementations
// ----------------------------------------------------------------

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("xtask has a parent directory")
        .to_path_buf()
}

/// Where a runnable build is staged: the executable plus `shaders/`.
fn out_dir() -> PathBuf {
    workspace_root().join("out").join(APP).join("debug")
}

fn is_up_to_date(src: &Path, dst: &Path) -> bool {
    let Ok(src_meta) = src.metadata() else {
        return false;
    };
    let Ok(dst_meta) = dst.metadata() else {
        return false;
    };
    let Ok(src_mtime) = src_meta.modified() else {
        return false;
    };
    let Ok(dst_mtime) = dst_meta.modified() else {
        return false;
    };
    src_mtime <= dst_mtime
}

fn run(cmd: &mut Command) -> Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(format!(
            "command {:?} failed with {}",
            cmd.get_program(),
            status
        )
        .into());
    }
    Ok(())
}

fn cargo_build() -> Result<()> {
    let root = workspace_root();
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    run(Command::new(cargo)
        .args(["build", "-p", APP])
        .current_dir(&root))
}

fn compile_shaders() -> Result<()> {
    let root = workspace_root();
    let src_dir = root.join(APP).join("shaders");
    let out_dir = out_dir().join("shaders");
    fs::create_dir_all(&out_dir)?;

    // (output suffix, extra slangc args)
    let variants: &[(&str, &[&str])] = &[("", &[]), (".debug", &["-g"])];

    let mut compiled = 0u32;
    let mut skipped = 0u32;

    for entry in fs::read_dir(&src_dir)? {
        let entry = entry?;
        let src = entry.path();
        if src.extension() != Some(OsStr::new("slang")) {
            continue;
        }
        let stem = src.file_stem().unwrap().to_string_lossy().into_owned();

        for &(suffix, extra_args) in variants {
            let dst = out_dir.join(format!("{stem}{suffix}.spv"));

            if is_up_to_date(&src, &dst) {
                skipped += 1;
                continue;
            }

            println!(
                "Compiling {} -> {}",
                src.file_name().unwrap().to_string_lossy(),
                dst.file_name().unwrap().to_string_lossy(),
            );

            run(Command::new("slangc")
                .arg(&src)
                .args(["-target", "spirv", "-matrix-layout-column-major", "-o"])
                .arg(&dst)
                .args(extra_args))?;

            compiled += 1;
        }
    }

    println!("Shaders: {compiled} compiled, {skipped} up-to-date");
    Ok(())
}

fn copy_if_changed(src: &Path, dst: &Path) -> Result<bool> {
    if is_up_to_date(src, dst) {
        return Ok(false);
    }
    fs::copy(src, dst)?;
    Ok(true)
}

fn copy_exe() -> Result<()> {
    let root = workspace_root();
    let out_dir = out_dir();
    fs::create_dir_all(&out_dir)?;

    let exe_suffix = env::consts::EXE_SUFFIX;
    let exe_name = format!("{APP}{exe_suffix}");
    let src_exe = root.join("target").join("debug").join(&exe_name);
    let dst_exe = out_dir.join(&exe_name);

    if copy_if_changed(&src_exe, &dst_exe)? {
        println!("Copied {exe_name}");
    } else {
        println!("Up-to-date: {exe_name}");
    }

    #[cfg(windows)]
    {
        let src_pdb = root.join("target").join("debug").join("tritex_app.pdb");
        let dst_pdb = out_dir.join("tritex_app.pdb");
        copy_if_changed(&src_pdb, &dst_pdb)?;
    }

    Ok(())
}

fn run_app() -> Result<()> {
    let exe = out_dir().join(format!("{APP}{}", env::consts::EXE_SUFFIX));
    let forwarded: Vec<String> = env::args()
        .skip_while(|a| a != "--")
        .skip(1)
        .collect();
    run(Command::new(&exe).args(&forwarded).current_dir(out_dir()))
}

fn clean() -> Result<()> {
    let dir = out_dir();
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
        println!("Removed {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_for(target: &str) -> Vec<&'static str> {
        let tasks = all_tasks();
        let mut visited = vec![false; tasks.len()];
        let mut order = Vec::new();
        collect_topo(&tasks, target, &mut visited, &mut order).unwrap();
        order.into_iter().map(|i| tasks[i].name).collect()
    }

    #[test]
    fn dependencies_run_first_and_once() {
        let order = order_for("run");
        assert_eq!(order.last(), Some(&"run"));
        let pos = |name| order.iter().position(|t| *t == name).unwrap();
        assert!(pos("cargo-build") < pos("copy-exe"));
        assert!(pos("copy-exe") < pos("build"));
        assert_eq!(order.iter().filter(|t| **t == "cargo-build").count(), 1);
        assert!(!order.contains(&"clean"));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let tasks = all_tasks();
        assert!(task_index(&tasks, "copy-assets").is_err());
    }
}
