use crate::process::{Invocation, MkvmergeParser, ToolRunner};
use crate::tools::ToolError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the concatenated container inside the workspace
pub const MASTER_NAME: &str = "master.mkv";

/// `mkvmerge --priority lower -o <out> a +b +c`: blind append in source order
pub fn concat_args(sources: &[PathBuf], out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--priority".into(),
        "lower".into(),
        "-o".into(),
        out.as_os_str().to_os_string(),
    ];
    for (i, source) in sources.iter().enumerate() {
        if i == 0 {
            args.push(source.as_os_str().to_os_string());
        } else {
            let mut appended = OsString::from("+");
            appended.push(source.as_os_str());
            args.push(appended);
        }
    }
    args
}

/// Merge per-track files into one gapless container in the workspace
pub async fn concat(
    runner: &ToolRunner,
    mkvmerge: &Path,
    sources: &[PathBuf],
) -> Result<PathBuf, ToolError> {
    let out = runner.workspace().join(MASTER_NAME);
    info!("Merging {} file(s) into {:?}", sources.len(), out);
    runner.message(format!("Merging {} tracks", sources.len()));

    let invocation = Invocation::new("mkvmerge", mkvmerge).args(concat_args(sources, &out));
    runner.run(invocation, &mut MkvmergeParser).await?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_args_append_in_order() {
        let sources = vec![
            PathBuf::from("/in/01.mka"),
            PathBuf::from("/in/02.mka"),
            PathBuf::from("/in/03.mka"),
        ];
        let args = concat_args(&sources, Path::new("/ws/master.mkv"));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--priority",
                "lower",
                "-o",
                "/ws/master.mkv",
                "/in/01.mka",
                "+/in/02.mka",
                "+/in/03.mka"
            ]
        );
    }
}
