//! 单次分析运行: 将 CCF 图谱区域边界叠加到标本 100141219 的第 62 张
//! 组织学切片上, 并高亮丘脑相关 ROI.
//!
//! 参数即下方字面量, 无 CLI.

use std::path::PathBuf;

use ccf_berry::prelude::*;

/// 标本 (image series) 标识.
const SPECIMEN: u64 = 100141219;

/// 目标切片索引.
const SECTION_INDEX: i64 = 62;

/// 需要高亮轮廓的 ROI. 对应 id: 1008, 1014, 218, 1029, 215.
const ROI_ACRONYMS: [&str; 5] = ["GENd", "GENv", "LP", "POL", "APN"];

/// 数据根目录: 环境变量 `CCF_DATASET_DIR` 优先, 否则 `{home}/dataset`.
fn dataset_dir() -> PathBuf {
    match std::env::var_os("CCF_DATASET_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => ccf_berry::dataset::home_dataset_dir().expect("无法定位用户主目录"),
    }
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let base = dataset_dir();
    assert!(base.is_dir(), "数据根目录不存在: {}", base.display());
    let store = SpecimenStore::new(base);

    let params = OverlayParams {
        specimen: SPECIMEN,
        section_index: SECTION_INDEX,
        roi_acronyms: ROI_ACRONYMS.iter().map(|s| (*s).to_owned()).collect(),
        style: OverlayStyle::default(),
    };

    match run_overlay(&store, &params) {
        Ok(paths) => {
            println!("area:      {}", paths.area.display());
            println!("boundary:  {}", paths.boundary.display());
            println!("composite: {}", paths.composite.display());
        }
        Err(e) => {
            eprintln!("overlay pipeline 失败: {e}");
            std::process::exit(1);
        }
    }
}
