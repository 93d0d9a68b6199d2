//! 线性 pipeline 驱动.
//!
//! 一次运行 = 一个标本 + 一个切片索引 + 一组 ROI. 流程为单趟前向:
//! 加载 -> 结构发现 -> 逐结构栅格化与绘制 -> 合成 -> 原子落盘.
//! 所有输入加载后作为不可变值在各阶段之间显式传递, 不存在全局状态.
//! 结构按顺序逐个处理, 同一时刻只保留一个结构的 3D 前景索引.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::annot::{AnnotVolume, VolumeAttr};
use crate::consts::{is_background, ROOT_STRUCTURE_ID, SECTION_SPACING_UM};
use crate::ontology::{LookupError, StructureTree};
use crate::overlay::{OverlayCanvas, OverlayPaths, OverlayStyle, SaveError};
use crate::raster::{rasterize_structure, SliceMapping};
use crate::section::{on_section, ImageGeom, OpenMetaError, SectionImage, SectionMeta};
use crate::warp::{transform_voxel, Affine3, DisplacementField, LoadAffineError, LoadFieldError};

/// pipeline 运行错误. 单次运行内所有失败都不可恢复, 直接向上传播.
#[derive(Debug)]
pub enum PipelineError {
    /// 本体查询/加载失败.
    Lookup(LookupError),

    /// 位移场加载失败.
    Field(LoadFieldError),

    /// 仿射参数加载失败.
    Affine(LoadAffineError),

    /// annotation 体数据加载失败.
    Nifti(nifti::NiftiError),

    /// 切片图像加载失败.
    Image(image::ImageError),

    /// 切片元信息加载失败.
    Meta(OpenMetaError),

    /// 输出落盘失败.
    Save(SaveError),

    /// 底层 I/O 错误, 附带出错的资源路径.
    Io(PathBuf, io::Error),

    /// annotation 体素分辨率不是各向同性, 无法确定统一的物理缩放.
    Anisotropic([f64; 3]),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup(e) => write!(f, "{e}"),
            Self::Field(e) => write!(f, "{e}"),
            Self::Affine(e) => write!(f, "{e}"),
            Self::Nifti(e) => write!(f, "annotation 体数据加载失败: {e}"),
            Self::Image(e) => write!(f, "切片图像加载失败: {e}"),
            Self::Meta(e) => write!(f, "{e}"),
            Self::Save(e) => write!(f, "{e}"),
            Self::Io(path, e) => write!(f, "资源 `{}` 访问失败: {e}", path.display()),
            Self::Anisotropic(dim) => {
                write!(f, "annotation 分辨率非各向同性: {dim:?}")
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lookup(e) => Some(e),
            Self::Field(e) => Some(e),
            Self::Affine(e) => Some(e),
            Self::Nifti(e) => Some(e),
            Self::Image(e) => Some(e),
            Self::Meta(e) => Some(e),
            Self::Save(e) => Some(e),
            Self::Io(_, e) => Some(e),
            Self::Anisotropic(_) => None,
        }
    }
}

macro_rules! impl_from_err {
    ($($src: ty => $variant: ident),+ $(,)?) => {
        $(
            impl From<$src> for PipelineError {
                fn from(e: $src) -> Self {
                    Self::$variant(e)
                }
            }
        )+
    };
}

impl_from_err!(
    LookupError => Lookup,
    LoadFieldError => Field,
    LoadAffineError => Affine,
    nifti::NiftiError => Nifti,
    image::ImageError => Image,
    OpenMetaError => Meta,
    SaveError => Save,
);

/// 一次叠加运行的全部参数. 无 CLI, 无配置文件, 由调用方以字面量给出.
#[derive(Debug, Clone)]
pub struct OverlayParams {
    /// 标本 (image series) 标识.
    pub specimen: u64,

    /// 目标切片索引.
    pub section_index: i64,

    /// 需要描绘轮廓的 ROI acronym 列表.
    pub roi_acronyms: Vec<String>,

    /// 绘制样式.
    pub style: OverlayStyle,
}

/// 标本数据在磁盘上的布局.
///
/// 上游提供方 (图谱/配准/图像服务) 的网络抓取机制不在该 crate 范围内:
/// 这里只读取提供方已物化到 `{base}/{specimen}/` 下的文件.
/// 缺失文件以 [`PipelineError::Io`] 形式报告, 错误信息点名缺失路径.
#[derive(Debug, Clone)]
pub struct SpecimenStore {
    base: PathBuf,
}

impl SpecimenStore {
    /// 以 `base` 为数据根目录初始化.
    #[inline]
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    /// 以 `{用户主目录}/dataset` 为数据根目录初始化.
    #[inline]
    pub fn from_home() -> Option<Self> {
        crate::dataset::home_dataset_dir().map(Self::new)
    }

    /// 某标本的数据目录. 输出文件也写到这里.
    #[inline]
    pub fn specimen_dir(&self, specimen: u64) -> PathBuf {
        self.base.join(specimen.to_string())
    }

    /// annotation 体数据 (nii) 路径.
    #[inline]
    pub fn annotation_path(&self, specimen: u64) -> PathBuf {
        self.specimen_dir(specimen).join("annotation.nii")
    }

    /// 本体树 (JSON) 路径.
    #[inline]
    pub fn ontology_path(&self, specimen: u64) -> PathBuf {
        self.specimen_dir(specimen).join("ontology.json")
    }

    /// 位移场 header (`.mhd`) 路径. 裸数据文件由 header 指认.
    #[inline]
    pub fn displacement_path(&self, specimen: u64) -> PathBuf {
        self.specimen_dir(specimen).join("displacement.mhd")
    }

    /// 仿射参数路径.
    #[inline]
    pub fn affine_path(&self, specimen: u64) -> PathBuf {
        self.specimen_dir(specimen).join("affine.txt")
    }

    /// 第 `index` 张切片图像路径.
    #[inline]
    pub fn section_image_path(&self, specimen: u64, index: i64) -> PathBuf {
        self.specimen_dir(specimen)
            .join(format!("section_{index}.png"))
    }

    /// 第 `index` 张切片元信息路径.
    #[inline]
    pub fn section_meta_path(&self, specimen: u64, index: i64) -> PathBuf {
        self.specimen_dir(specimen)
            .join(format!("section_{index}.json"))
    }
}

/// 检查路径存在性, 把缺失文件变成点名路径的错误.
fn require_file(path: &Path) -> Result<&Path, PipelineError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(PipelineError::Io(
            path.to_owned(),
            io::Error::new(io::ErrorKind::NotFound, "文件不存在"),
        ))
    }
}

/// 结构发现: 计算与目标切片相交的结构 id 集合, 并给出绘制顺序.
///
/// 将全脑 (非背景) 体素经坐标映射后, 保留落在目标切片上的那些,
/// 读取其对应的 annotation label 集合; 再无条件并入 `roi_ids`
/// (父结构可能不在原始 annotation 中出现, 但仍需要绘制).
///
/// 返回值按祖先深度升序排列 (最一般的结构最先), 深度相同按 id 升序,
/// 从而后续栅格化时子结构覆盖父结构且顺序确定.
/// 没有任何体素落在目标切片上时, 返回值即排好序的 `roi_ids`.
pub fn structures_on_section(
    annot: &AnnotVolume,
    tree: &StructureTree,
    field: &DisplacementField,
    affine: &Affine3,
    map: &SliceMapping,
    roi_ids: &[u32],
) -> Vec<u32> {
    let mut found = HashSet::new();

    for (pos, &label) in annot.data().indexed_iter() {
        if is_background(label) || found.contains(&label) {
            continue;
        }
        let q = transform_voxel(field, affine, pos, map.resolution_um);
        if on_section(q[2], map.spacing_um, map.section_index) {
            found.insert(label);
        }
    }
    debug!("目标切片 {} 上发现 {} 个结构", map.section_index, found.len());

    // ROI 无条件并入, 即使未被发现.
    found.extend(roi_ids.iter().copied());

    let mut order: Vec<u32> = found.into_iter().collect();
    order.sort_unstable_by_key(|&id| (tree.depth(id).unwrap_or(0), id));
    order
}

/// 运行整条叠加 pipeline.
///
/// 成功时返回三张输出图的路径; 任何失败都不会留下部分输出文件.
pub fn run_overlay(
    store: &SpecimenStore,
    params: &OverlayParams,
) -> Result<OverlayPaths, PipelineError> {
    info!(
        "overlay pipeline: specimen {}, section {}",
        params.specimen, params.section_index
    );

    let tree = StructureTree::open(require_file(&store.ontology_path(params.specimen))?)?;
    let annot = AnnotVolume::open(require_file(&store.annotation_path(params.specimen))?)?;
    let field = DisplacementField::open(require_file(&store.displacement_path(params.specimen))?)?;
    let affine = Affine3::open(require_file(&store.affine_path(params.specimen))?)?;

    let meta = SectionMeta::open(require_file(
        &store.section_meta_path(params.specimen, params.section_index),
    )?)?;
    let section = SectionImage::open(
        require_file(&store.section_image_path(params.specimen, params.section_index))?,
        meta,
    )?;

    let pix_dim = annot.pix_dim();
    if !annot.is_isotropic() {
        return Err(PipelineError::Anisotropic(pix_dim));
    }
    let map = SliceMapping {
        resolution_um: pix_dim[0],
        spacing_um: SECTION_SPACING_UM,
        section_index: params.section_index,
        geom: ImageGeom::new(&meta),
    };
    info!(
        "annotation {:?} @ {} 微米, 图像 {:?} @ {} 微米/像素",
        annot.shape(),
        map.resolution_um,
        section.shape(),
        map.geom.um_per_px()
    );

    let roi_ids = tree.resolve_acronyms(&params.roi_acronyms)?;
    let order = structures_on_section(&annot, &tree, &field, &affine, &map, &roi_ids);
    info!("待绘制结构: {} 个", order.len());

    let mut canvas = OverlayCanvas::new(&section);
    for &id in &order {
        // 结构 mask = 自身 + 全部后代; label 不在本体树中时退化为仅自身.
        let mut ids: HashSet<u32> = tree.descendant_ids(id).into_iter().collect();
        ids.insert(id);

        let mask = rasterize_structure(&annot, &ids, &field, &affine, &map, section.shape());
        if mask.is_empty() {
            debug!("结构 {id} 在目标切片上无像素, 跳过");
            continue;
        }

        if id != ROOT_STRUCTURE_ID {
            canvas.paint_area(&mask, tree.color_of(id));
        }
        if roi_ids.contains(&id) {
            canvas.draw_boundary(&mask, &params.style);
        }
    }

    let paths = canvas.save_all(store.specimen_dir(params.specimen), &section, &params.style)?;
    info!("输出已写出: {}", paths.composite.display());
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::Structure;
    use crate::section::SectionMeta;
    use ndarray::Array3;

    /// 一棵小型测试树: root -> TH -> {GENd, GENv, LP, POL}, root -> APN.
    fn thalamus_tree() -> StructureTree {
        let node = |id: u32, acronym: &str, path: &[u32]| Structure {
            id,
            acronym: acronym.to_owned(),
            name: format!("structure {acronym}"),
            rgb: [id as u8, (id >> 8) as u8, 0x40],
            path: path.to_vec(),
        };
        StructureTree::fake([
            node(997, "root", &[997]),
            node(549, "TH", &[997, 549]),
            node(1008, "GENd", &[997, 549, 1008]),
            node(1014, "GENv", &[997, 549, 1014]),
            node(218, "LP", &[997, 549, 218]),
            node(1029, "POL", &[997, 549, 1029]),
            node(215, "APN", &[997, 215]),
        ])
    }

    fn identity_setup(
        annot_data: Array3<u32>,
    ) -> (AnnotVolume, DisplacementField, Affine3, SliceMapping) {
        let shape = annot_data.dim();
        let annot = AnnotVolume::fake(annot_data, [25.0, 25.0, 25.0]);
        let field = DisplacementField::identity(shape, [25.0, 25.0, 25.0]);
        let meta = SectionMeta {
            resolution: 25.0,
            downsample: 0,
            intensity_range: [0, 4095],
        };
        let map = SliceMapping {
            resolution_um: 25.0,
            spacing_um: 100.0,
            section_index: 0,
            geom: ImageGeom::new(&meta),
        };
        (annot, field, Affine3::identity(), map)
    }

    #[test]
    fn test_discovery_includes_rois_even_if_absent() {
        // annotation 中只出现 LP (218); 其余四个 ROI 必须被强制并入.
        let mut data = Array3::<u32>::zeros((2, 4, 4));
        data[(0, 1, 1)] = 218;
        let (annot, field, affine, map) = identity_setup(data);
        let tree = thalamus_tree();

        let rois = [1008u32, 1014, 218, 1029, 215];
        let order = structures_on_section(&annot, &tree, &field, &affine, &map, &rois);

        for id in rois {
            assert!(order.contains(&id), "ROI {id} 未并入");
        }
    }

    #[test]
    fn test_discovery_orders_ancestors_first() {
        // TH (深度 2) 与 LP (深度 3) 同时出现: TH 必须排在 LP 之前.
        let mut data = Array3::<u32>::zeros((1, 4, 4));
        data[(0, 0, 0)] = 549;
        data[(0, 2, 2)] = 218;
        data[(0, 3, 3)] = 997;
        let (annot, field, affine, map) = identity_setup(data);
        let tree = thalamus_tree();

        let order = structures_on_section(&annot, &tree, &field, &affine, &map, &[]);
        let pos =
            |id: u32| order.iter().position(|&x| x == id).unwrap_or_else(|| panic!("缺少 {id}"));

        assert!(pos(997) < pos(549));
        assert!(pos(549) < pos(218));
    }

    #[test]
    fn test_discovery_empty_section_returns_rois_only() {
        // 前景全部在 z = 0 (切片 0), 而目标切片是 9: 发现集为空, 仅剩 ROI.
        let mut data = Array3::<u32>::zeros((1, 4, 4));
        data[(0, 1, 1)] = 218;
        let (annot, field, affine, mut map) = identity_setup(data);
        map.section_index = 9;
        let tree = thalamus_tree();

        let order = structures_on_section(&annot, &tree, &field, &affine, &map, &[215, 218]);
        assert_eq!(order, vec![215, 218]);
    }

    #[test]
    fn test_discovery_deterministic_order() {
        let mut data = Array3::<u32>::zeros((1, 4, 4));
        data[(0, 0, 1)] = 1008;
        data[(0, 0, 2)] = 1014;
        data[(0, 0, 3)] = 215;
        let (annot, field, affine, map) = identity_setup(data);
        let tree = thalamus_tree();

        let a = structures_on_section(&annot, &tree, &field, &affine, &map, &[218]);
        let b = structures_on_section(&annot, &tree, &field, &affine, &map, &[218]);
        assert_eq!(a, b);
        // APN (215) 深度 2 最先; 其余深度均为 3, 按 id 升序.
        assert_eq!(a, vec![215, 218, 1008, 1014]);
    }

    #[test]
    fn test_store_layout() {
        let store = SpecimenStore::new("/data/root");
        let dir = store.specimen_dir(100141219);
        assert_eq!(dir, PathBuf::from("/data/root/100141219"));
        assert_eq!(
            store.section_image_path(100141219, 62),
            dir.join("section_62.png")
        );
        assert_eq!(
            store.section_meta_path(100141219, 62),
            dir.join("section_62.json")
        );
        assert_eq!(store.displacement_path(100141219), dir.join("displacement.mhd"));
    }

    #[test]
    fn test_missing_resource_names_path() {
        let store = SpecimenStore::new("/nonexistent-ccf-root");
        let params = OverlayParams {
            specimen: 100141219,
            section_index: 62,
            roi_acronyms: vec!["LP".to_owned()],
            style: OverlayStyle::default(),
        };
        let err = run_overlay(&store, &params).unwrap_err();
        match err {
            PipelineError::Io(path, _) => {
                assert!(path.to_string_lossy().contains("100141219"));
            }
            other => panic!("期望 Io 错误, 实际 {other:?}"),
        }
    }
}
