use nom::error::{ErrorKind, ParseError};
use nom::{Err, IResult, InputLength, Parser};
use tinyvec::{Array, ArrayVec};

/// Like `nom::multi::many0`, collecting into a fixed capacity `ArrayVec`.
///
/// Fails with `ErrorKind::TooLarge` instead of growing past the capacity.
#[inline(always)]
pub fn many0<I, O, E, F, A>(mut f: F) -> impl FnMut(I) -> IResult<I, ArrayVec<A>, E>
where
    I: Clone + InputLength,
    F: Parser<I, O, E>,
    E: ParseError<I>,
    A: Array<Item = O>,
{
    move |mut i: I| {
        let mut acc = ArrayVec::default();
        loop {
            let len = i.input_len();
            match f.parse(i.clone()) {
                Err(Err::Error(_)) => return Ok((i, acc)),
                Err(e) => return Err(e),
                Ok((i1, o)) => {
                    // infinite loop check: the parser must always consume
                    if i1.input_len() == len {
                        return Err(Err::Error(E::from_error_kind(i, ErrorKind::Many0)));
                    }

                    if acc.try_push(o).is_some() {
                        return Err(Err::Failure(E::from_error_kind(i, ErrorKind::TooLarge)));
                    }

                    i = i1;
                }
            }
        }
    }
}
