//! external filesystem tooling
//!
//! squashfs creation/extraction and ext3 mounting are delegated to host
//! binaries. [`FsTools`] is the seam; [`HostTools`] runs the real commands.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use crate::config::ToolPaths;
use crate::error::{Error, Result};

/// filesystem operations that need host tooling
pub trait FsTools: Send + Sync {
    /// build a squashfs image at `dest` from a tar stream
    fn tar_to_squashfs(&self, tar: &mut dyn Read, dest: &Path) -> Result<()>;

    /// stream the contents of squashfs image `image` as tar into `out`
    fn squashfs_to_tar(&self, image: &Path, out: &mut dyn Write) -> Result<()>;

    /// build a squashfs image at `dest` from directory `src`, skipping any
    /// entry whose basename is in `exclude_names`
    fn dir_to_squashfs(&self, src: &Path, dest: &Path, exclude_names: &[String]) -> Result<()>;

    /// mount the ext3 filesystem at byte `offset` of `image` read-only on `mnt`
    fn mount_ext3(&self, image: &Path, offset: u64, mnt: &Path) -> Result<()>;

    fn unmount(&self, mnt: &Path) -> Result<()>;
}

/// [`FsTools`] backed by mksquashfs, sqfs2tar, fuse2fs and fusermount
#[derive(Clone, Debug, Default)]
pub struct HostTools {
    paths: ToolPaths,
}

impl HostTools {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    fn mksquashfs_tuning(&self, args: &mut Vec<OsString>) {
        if let Some(n) = self.paths.mksquashfs_processors {
            args.push("-processors".into());
            args.push(n.to_string().into());
        }
        if let Some(mem) = &self.paths.mksquashfs_mem {
            args.push("-mem".into());
            args.push(mem.into());
        }
    }

    /// arguments for building squashfs from a tar stream on stdin
    pub fn tar_to_squashfs_args(&self, dest: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-".into(), dest.into(), "-tar".into(), "-noappend".into()];
        self.mksquashfs_tuning(&mut args);
        args
    }

    /// arguments for building squashfs from a directory
    pub fn dir_to_squashfs_args(
        &self,
        src: &Path,
        dest: &Path,
        exclude_names: &[String],
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![src.into(), dest.into(), "-noappend".into()];
        if !exclude_names.is_empty() {
            args.push("-wildcards".into());
            for name in exclude_names {
                args.push("-e".into());
                // "..." matches the name in any directory
                args.push(format!("... {}", name).into());
            }
        }
        self.mksquashfs_tuning(&mut args);
        args
    }

    pub fn squashfs_to_tar_args(&self, image: &Path) -> Vec<OsString> {
        vec![image.into()]
    }

    pub fn mount_ext3_args(&self, image: &Path, offset: u64, mnt: &Path) -> Vec<OsString> {
        vec![
            "-o".into(),
            format!("ro,fakeroot,offset={}", offset).into(),
            image.into(),
            mnt.into(),
        ]
    }

    pub fn unmount_args(&self, mnt: &Path) -> Vec<OsString> {
        vec!["-u".into(), mnt.into()]
    }
}

impl FsTools for HostTools {
    fn tar_to_squashfs(&self, tar: &mut dyn Read, dest: &Path) -> Result<()> {
        let args = self.tar_to_squashfs_args(dest);
        run_tool(&self.paths.mksquashfs, &args, Some(tar), None).map_err(|e| e.into_tool_error())
    }

    fn squashfs_to_tar(&self, image: &Path, out: &mut dyn Write) -> Result<()> {
        let args = self.squashfs_to_tar_args(image);
        run_tool(&self.paths.sqfs2tar, &args, None, Some(out)).map_err(|e| e.into_tool_error())
    }

    fn dir_to_squashfs(&self, src: &Path, dest: &Path, exclude_names: &[String]) -> Result<()> {
        let args = self.dir_to_squashfs_args(src, dest, exclude_names);
        run_tool(&self.paths.mksquashfs, &args, None, None).map_err(|e| e.into_tool_error())
    }

    fn mount_ext3(&self, image: &Path, offset: u64, mnt: &Path) -> Result<()> {
        let args = self.mount_ext3_args(image, offset, mnt);
        run_tool(&self.paths.fuse2fs, &args, None, None).map_err(|e| Error::Mount {
            path: mnt.to_path_buf(),
            message: e.message(),
        })
    }

    fn unmount(&self, mnt: &Path) -> Result<()> {
        let args = self.unmount_args(mnt);
        run_tool(&self.paths.fusermount, &args, None, None).map_err(|e| Error::Unmount {
            path: mnt.to_path_buf(),
            message: e.message(),
        })
    }
}

/// failure of a single tool invocation, before it is mapped to [`Error`]
#[derive(Debug)]
struct ToolFailure {
    tool: PathBuf,
    kind: ToolFailureKind,
}

#[derive(Debug)]
enum ToolFailureKind {
    Spawn(io::Error),
    Exit { status: ExitStatus, stderr: String },
    Stream(io::Error),
}

impl ToolFailure {
    fn message(&self) -> String {
        match &self.kind {
            ToolFailureKind::Spawn(e) => format!("failed to start {}: {}", self.tool.display(), e),
            ToolFailureKind::Exit { status, stderr } if stderr.is_empty() => status.to_string(),
            ToolFailureKind::Exit { status, stderr } => format!("{}: {}", status, stderr),
            ToolFailureKind::Stream(e) => format!("stream error: {}", e),
        }
    }

    fn into_tool_error(self) -> Error {
        Error::Tool {
            tool: self.tool.display().to_string(),
            message: self.message(),
        }
    }
}

/// run `tool`, optionally feeding stdin and draining stdout; stderr is
/// collected for the error message
fn run_tool(
    tool: &Path,
    args: &[OsString],
    stdin: Option<&mut dyn Read>,
    stdout: Option<&mut dyn Write>,
) -> std::result::Result<(), ToolFailure> {
    let fail = |kind| ToolFailure {
        tool: tool.to_path_buf(),
        kind,
    };

    tracing::debug!(tool = %tool.display(), ?args, "running tool");

    let mut cmd = Command::new(tool);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(if stdout.is_some() { Stdio::piped() } else { Stdio::null() })
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| fail(ToolFailureKind::Spawn(e)))?;

    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = err.read_to_string(&mut buf);
            buf
        })
    });

    let mut stream_result = Ok(());
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        stream_result = io::copy(input, &mut pipe).map(|_| ());
        // close stdin so the tool sees eof
        drop(pipe);
    }
    if let (Some(output), Some(mut pipe)) = (stdout, child.stdout.take()) {
        if stream_result.is_ok() {
            stream_result = io::copy(&mut pipe, output).map(|_| ());
        }
    }

    let status = child.wait().map_err(|e| fail(ToolFailureKind::Spawn(e)))?;
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
        .trim()
        .to_string();

    if !status.success() {
        return Err(fail(ToolFailureKind::Exit { status, stderr }));
    }
    stream_result.map_err(|e| fail(ToolFailureKind::Stream(e)))
}
