use crate::common::*;

/// Area-average resample of a square `(h, w, ch)` image to a new edge
/// size.
///
/// Edge sizes are powers of two, so the scale factor is an exact
/// integer in one direction: downscaling averages non-overlapping
/// blocks with round-to-nearest, upscaling replicates pixels.
pub fn resize_area(img: &Array3<u8>, target: usize) -> Array3<u8> {
    let (size, _, _) = img.dim();
    match size.cmp(&target) {
        std::cmp::Ordering::Equal => img.clone(),
        std::cmp::Ordering::Greater => downscale(img, target),
        std::cmp::Ordering::Less => upscale(img, target),
    }
}

fn downscale(img: &Array3<u8>, target: usize) -> Array3<u8> {
    let (size, _, ch) = img.dim();
    let factor = size / target;
    let area = (factor * factor) as u32;
    let mut out = Array3::zeros((target, target, ch));
    for y in 0..target {
        for x in 0..target {
            for c in 0..ch {
                let mut sum = 0u32;
                for dy in 0..factor {
                    for dx in 0..factor {
                        sum += u32::from(img[[y * factor + dy, x * factor + dx, c]]);
                    }
                }
                out[[y, x, c]] = ((sum + area / 2) / area) as u8;
            }
        }
    }
    out
}

fn upscale(img: &Array3<u8>, target: usize) -> Array3<u8> {
    let (size, _, ch) = img.dim();
    let factor = target / size;
    let mut out = Array3::zeros((target, target, ch));
    for y in 0..target {
        for x in 0..target {
            for c in 0..ch {
                out[[y, x, c]] = img[[y / factor, x / factor, c]];
            }
        }
    }
    out
}

/// Replicate the single channel of a `(h, w, 1)` image across the
/// target channel count.
pub fn replicate_channels(img: &Array3<u8>, channels: usize) -> Array3<u8> {
    let (h, w, _) = img.dim();
    let mut out = Array3::zeros((h, w, channels));
    for c in 0..channels {
        out.slice_mut(s![.., .., c]).assign(&img.slice(s![.., .., 0]));
    }
    out
}
