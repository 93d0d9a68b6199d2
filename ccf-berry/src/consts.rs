//! 通用常量.

/// CCF annotation 体数据的体素分辨率, 单位为微米. 各向同性.
pub const ATLAS_RESOLUTION_UM: f64 = 25.0;

/// 相邻组织学切片之间的间距, 单位为微米. 与名义 100 微米切片厚度一致.
pub const SECTION_SPACING_UM: f64 = 100.0;

/// 本体树的根结构 ("root", 全脑) 的 id.
pub const ROOT_STRUCTURE_ID: u32 = 997;

/// annotation 体数据中未标注体素的 label 值.
pub const BACKGROUND_ID: u32 = 0;

/// 区域轮廓宽度控制: boundary = mask 减去 mask 被腐蚀该次数后的结果.
///
/// 默认值保留自上游 pipeline, 可通过 [`crate::overlay::OverlayStyle`] 覆盖.
pub const DEFAULT_BOUNDARY_ERODE_ITERS: u32 = 6;

/// 合成图 (color_composite) 中 area 叠加层的不透明度, 约为 31%.
///
/// 默认值保留自上游 pipeline, 可通过 [`crate::overlay::OverlayStyle`] 覆盖.
pub const DEFAULT_BLEND_ALPHA: u8 = 80;

/// 三通道颜色.
pub mod rgb {
    /// ROI 轮廓的默认高亮颜色.
    pub const BOUNDARY_HIGHLIGHT: [u8; 3] = [0xff, 0x00, 0x00];

    /// 三通道黑色. area 图的初始底色.
    pub const BLACK: [u8; 3] = [0x00, 0x00, 0x00];

    /// 三通道白色. 本体树中缺失颜色信息的结构的兜底颜色.
    pub const WHITE: [u8; 3] = [0xff, 0xff, 0xff];

    /// 像素是否是黑色?
    #[inline]
    pub const fn is_black(p: [u8; 3]) -> bool {
        matches!(p, [0, 0, 0])
    }
}

/// label 是否是背景?
#[inline]
pub const fn is_background(label: u32) -> bool {
    matches!(label, BACKGROUND_ID)
}

/// label 是否是根结构?
#[inline]
pub const fn is_root(label: u32) -> bool {
    matches!(label, ROOT_STRUCTURE_ID)
}
