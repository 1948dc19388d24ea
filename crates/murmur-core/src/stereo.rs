//! Stereo panning transforms.
//!
//! A [`Stereo`] value is an affine map on a stereo position: a scale and
//! shift on the X axis, optionally paired with a second axis. Transforms on
//! nested channels compose down to the transform applied to a note.

/// An affine pan/scale transform.
///
/// `Identity` is no shift and no scale. The one-axis form scales and
/// shifts left/right positions; the two-axis form adds a front/back axis.
/// Only the X axis reaches the mixer; the Y axis is carried through
/// composition for soundscapes that position sources on a plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Stereo {
    #[default]
    Identity,
    X {
        scale: f64,
        shift: f64,
    },
    Xy {
        xscale: f64,
        xshift: f64,
        yscale: f64,
        yshift: f64,
    },
}

impl Stereo {
    /// No shift, no scale.
    pub fn default_pos() -> Stereo {
        Stereo::Identity
    }

    /// Shift the origin: -1 is directly left, 1 directly right. More
    /// extreme values recede into the distance.
    pub fn shift(pos: f64) -> Stereo {
        if pos == 0.0 {
            Stereo::Identity
        } else {
            Stereo::X {
                scale: 1.0,
                shift: pos,
            }
        }
    }

    /// Two-dimensional shift. A zero Y component collapses to `shift(x)`.
    pub fn shiftxy(posx: f64, posy: f64) -> Stereo {
        if posy == 0.0 {
            Stereo::shift(posx)
        } else {
            Stereo::Xy {
                xscale: 1.0,
                xshift: posx,
                yscale: 1.0,
                yshift: posy,
            }
        }
    }

    /// Compress or stretch the field from the center. Sizes below 1
    /// narrow the pair, 0 collapses to a point, negative sizes swap the
    /// left and right channels.
    pub fn scale(size: f64) -> Stereo {
        if size == 1.0 {
            Stereo::Identity
        } else {
            Stereo::X {
                scale: size,
                shift: 0.0,
            }
        }
    }

    /// Two-dimensional scaling. A unit Y component collapses to `scale(x)`.
    pub fn scalexy(sizex: f64, sizey: f64) -> Stereo {
        if sizey == 1.0 {
            Stereo::scale(sizex)
        } else {
            Stereo::Xy {
                xscale: sizex,
                xshift: 0.0,
                yscale: sizey,
                yshift: 0.0,
            }
        }
    }

    /// Compress to a single point on the X axis: every contained sound
    /// comes from `pos`, no matter how shifted.
    pub fn fixed(pos: f64) -> Stereo {
        Stereo::X {
            scale: 0.0,
            shift: pos,
        }
    }

    /// Compress to a point on the Y axis.
    pub fn fixedy(posy: f64) -> Stereo {
        Stereo::Xy {
            xscale: 1.0,
            xshift: 0.0,
            yscale: 0.0,
            yshift: posy,
        }
    }

    /// Compress to a point on the XY plane.
    pub fn fixedxy(posx: f64, posy: f64) -> Stereo {
        Stereo::Xy {
            xscale: 0.0,
            xshift: posx,
            yscale: 0.0,
            yshift: posy,
        }
    }

    /// Number of stored axis values: 0, 2, or 4.
    pub fn width(&self) -> usize {
        match self {
            Stereo::Identity => 0,
            Stereo::X { .. } => 2,
            Stereo::Xy { .. } => 4,
        }
    }

    /// The effective `(xscale, xshift)` pair.
    pub fn x_axis(&self) -> (f64, f64) {
        match *self {
            Stereo::Identity => (1.0, 0.0),
            Stereo::X { scale, shift } => (scale, shift),
            Stereo::Xy { xscale, xshift, .. } => (xscale, xshift),
        }
    }

    /// Widen to the full `(xscale, xshift, yscale, yshift)` form.
    pub fn extended(&self) -> (f64, f64, f64, f64) {
        match *self {
            Stereo::Identity => (1.0, 0.0, 1.0, 0.0),
            Stereo::X { scale, shift } => (scale, shift, 1.0, 0.0),
            Stereo::Xy {
                xscale,
                xshift,
                yscale,
                yshift,
            } => (xscale, xshift, yscale, yshift),
        }
    }

    /// Apply `self` on top of `inner`: the result of a channel set to
    /// `self` containing a channel (or note) set to `inner`. The result's
    /// width is the wider of the two operands.
    pub fn compose(&self, inner: Stereo) -> Stereo {
        let width = self.width().max(inner.width());
        match width {
            0 => Stereo::Identity,
            2 => {
                let (s1, h1) = self.x_axis();
                let (s2, h2) = inner.x_axis();
                Stereo::X {
                    scale: s2 * s1,
                    shift: h2 * s1 + h1,
                }
            }
            _ => {
                let (xs1, xh1, ys1, yh1) = self.extended();
                let (xs2, xh2, ys2, yh2) = inner.extended();
                Stereo::Xy {
                    xscale: xs2 * xs1,
                    xshift: xh2 * xs1 + xh1,
                    yscale: ys2 * ys1,
                    yshift: yh2 * ys1 + yh1,
                }
            }
        }
    }
}

/// A bare number casts to a simple shift, as in `sched_note_pan(.., -1.0, ..)`.
impl From<f64> for Stereo {
    fn from(pos: f64) -> Stereo {
        Stereo::shift(pos)
    }
}
