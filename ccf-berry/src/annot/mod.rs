//! nii 格式的参考图谱 annotation 体数据.
//!
//! 体素值是结构 id (`u32`), 0 代表未标注. 数据加载后按 `[z, H, W]`
//! 布局访问, 加载一次后只读.

use std::collections::HashSet;
use std::path::Path;

use ndarray::{Array3, ArrayView, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::is_background;
use crate::{Idx2d, Idx3d};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    // [W, H, z]. 体素个数数组.
    let [_, w, h, z, ..] = h.dim;
    (z as usize, h as usize, w as usize)
}

/// nii 文件 header 的共用属性.
pub trait VolumeAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小.
    #[inline]
    fn shape(&self) -> Idx3d {
        get_shape_from_header(self.header())
    }

    /// 获取数据水平切片形状大小.
    #[inline]
    fn slice_shape(&self) -> Idx2d {
        let (_, h, w) = self.shape();
        (h, w)
    }

    /// 获取水平切片个数.
    #[inline]
    fn len_z(&self) -> usize {
        self.shape().0
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素分辨率, 单位为微米, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, w, h, z, ..] = self.header().pixdim;
        [z as f64, h as f64, w as f64]
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    fn is_isotropic(&self) -> bool {
        let [z, h, w] = self.pix_dim();
        z == h && z == w
    }
}

/// nii 格式的 3D annotation 体数据, 包括 header 和逐体素结构 id.
#[derive(Debug, Clone)]
pub struct AnnotVolume {
    header: BoxedHeader,
    data: Array3<u32>,
}

impl VolumeAttr for AnnotVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl AnnotVolume {
    /// 打开 nii 文件格式的 annotation 体数据. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        // [W, H, z] -> [z, H, W].
        // hint: 原第一维向下增长, 原第二维向右增长.
        let data = obj
            .into_volume()
            .into_ndarray::<u32>()?
            .permuted_axes([2, 1, 0].as_slice());

        // The nature of nifti data field layout.
        debug_assert!(data.is_standard_layout());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data =
            Array3::<u32>::from_shape_vec(get_shape_from_header(&header), data.into_raw_vec())
                .unwrap();

        Ok(Self { header, data })
    }

    /// 根据裸 label 数据和体素分辨率直接创建 `AnnotVolume` 实体.
    ///
    /// # 参数
    ///
    /// 1. `data` 按照 \[z, H, W\] 格式组织.
    /// 2. `pix_dim` 按照 \[w, h, z\] 格式存储, 单位为微米.
    ///
    /// # 注意
    ///
    /// 该方法可能会创建不一致的实体, 因此你应仅将其用于实验目的.
    pub fn fake(data: Array3<u32>, pix_dim: [f32; 3]) -> Self {
        let (z, h, w) = data.dim();

        let mut header = Box::<NiftiHeader>::default();
        header.dim = [3, w as u16, h as u16, z as u16, 1, 1, 1, 1];
        let [_, pw, ph, pz, ..] = &mut header.pixdim;
        let [dw, dh, dz] = &pix_dim;
        (*pw, *ph, *pz) = (*dw, *dh, *dz);
        header.intent_name[..4].copy_from_slice(b"fake");

        Self { header, data }
    }

    /// 判断该结构是否是由 `fake` 方法手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u32, Ix3> {
        self.data.view()
    }

    /// 获取给定位置的结构 id. 越界时返回 `None`.
    #[inline]
    pub fn label_at(&self, pos: Idx3d) -> Option<u32> {
        self.data.get(pos).copied()
    }

    /// 收集由 `it` 给出的所有索引对应的非背景结构 id 集合.
    ///
    /// 如果存在越界索引, 则程序 panic.
    pub fn labels_at<I: IntoIterator<Item = Idx3d>>(&self, it: I) -> HashSet<u32> {
        it.into_iter()
            .map(|pos| self.data[pos])
            .filter(|&label| !is_background(label))
            .collect()
    }

    /// 收集 label 属于 `ids` 的所有体素对应的下标. 结果按行优先存储.
    ///
    /// `ids` 通常是某结构自身 id 加其全部后代 id
    /// (参见 [`crate::StructureTree::descendant_ids`]),
    /// 此时结果就是该结构的 3D 二值 mask 的前景索引集.
    pub fn structure_pos(&self, ids: &HashSet<u32>) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(ref pos, label)| ids.contains(label).then_some(*pos))
            .collect()
    }

    /// 获取 3D 数据中 label 为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u32) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn tiny_volume() -> AnnotVolume {
        // 2 x 2 x 3, 两个切片: 第 0 片含 label 7, 第 1 片含 label 8 和 9.
        let mut data = Array3::<u32>::zeros((2, 2, 3));
        data[(0, 0, 0)] = 7;
        data[(0, 1, 2)] = 7;
        data[(1, 0, 1)] = 8;
        data[(1, 1, 1)] = 9;
        AnnotVolume::fake(data, [25.0, 25.0, 25.0])
    }

    #[test]
    fn test_fake_shape_and_pixdim() {
        let v = tiny_volume();
        assert!(v.is_faked());
        assert_eq!(v.shape(), (2, 2, 3));
        assert_eq!(v.slice_shape(), (2, 3));
        assert_eq!(v.len_z(), 2);
        assert_eq!(v.size(), 12);
        assert!(v.is_isotropic());
        assert_eq!(v.pix_dim(), [25.0, 25.0, 25.0]);
    }

    #[test]
    fn test_labels_at_skips_background() {
        let v = tiny_volume();
        let labels = v.labels_at([(0, 0, 0), (0, 0, 1), (1, 1, 1)]);
        assert_eq!(labels.len(), 2);
        assert!(labels.contains(&7));
        assert!(labels.contains(&9));
    }

    #[test]
    fn test_structure_pos() {
        let v = tiny_volume();
        let ids = HashSet::from([7u32]);
        assert_eq!(v.structure_pos(&ids), vec![(0, 0, 0), (0, 1, 2)]);

        let both = HashSet::from([8u32, 9u32]);
        assert_eq!(v.structure_pos(&both), vec![(1, 0, 1), (1, 1, 1)]);
        assert_eq!(v.count(0), 8);
    }

    #[test]
    fn test_check_bounds() {
        let v = tiny_volume();
        assert!(v.check(&(1, 1, 2)));
        assert!(!v.check(&(2, 0, 0)));
        assert_eq!(v.label_at((5, 5, 5)), None);
    }
}
