use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=third_party/ffmpeg/bin");

    // Only the ffmpeg-backed build links against the FFmpeg shared libraries
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        return;
    }

    let ffmpeg_bin = PathBuf::from("third_party/ffmpeg/bin");
    if !ffmpeg_bin.exists() {
        println!(
            "cargo:warning=FFmpeg DLLs not found at {}",
            ffmpeg_bin.display()
        );
        return;
    }

    // OUT_DIR is target/<profile>/build/<crate>/out, the binaries live three levels up
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").unwrap());
    let target_dir = out_dir
        .ancestors()
        .nth(3)
        .expect("Cannot resolve target dir");

    for entry in std::fs::read_dir(&ffmpeg_bin).expect("Cannot read ffmpeg bin dir") {
        let path = entry.unwrap().path();
        if !is_required_ffmpeg_dll(&path) {
            continue;
        }
        let dest = target_dir.join(path.file_name().unwrap());
        if !dest.exists() || file_modified(&path) > file_modified(&dest) {
            std::fs::copy(&path, &dest)
                .unwrap_or_else(|e| panic!("Failed to copy {:?} → {:?}: {}", path, dest, e));
            println!("cargo:warning=Copied {} to output dir", path.display());
        }
    }
    println!("cargo:rustc-link-search=native={}", ffmpeg_bin.display());
}

fn file_modified(path: &std::path::Path) -> std::time::SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
}

fn is_required_ffmpeg_dll(path: &std::path::Path) -> bool {
    const REQUIRED_DLL_PREFIXES: &[&str] = &["avcodec-", "avformat-", "avutil-", "swresample-", "swscale-"];

    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".dll") && REQUIRED_DLL_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}
