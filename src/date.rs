use tracing::warn;

/// Derives the study date token from the name of an input file.
///
/// The final path segment is taken, everything from its first `.` on is dropped and hyphens are
/// removed, so `/data/2020-07-01.txt` becomes `20200701`. The token is not validated: a name that
/// does not start with a date yields whatever its leading part is.
pub fn date_get(input_file: &str) -> String {
	let file_name = input_file
		.trim_end_matches('/')
		.rsplit('/')
		.next()
		.unwrap_or_default();
	let stem = file_name.split('.').next().unwrap_or_default();
	let date = stem.replace('-', "");

	if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
		warn!(input_file, date, "File name does not encode a YYYYMMDD date");
	}
	date
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("/data/2020-07-01.txt", "20200701")]
	#[case("2020-07-01.txt", "20200701")]
	#[case("/incoming/2019/2019-12-31.txt", "20191231")]
	#[case("2020-07-01.extra.txt", "20200701")]
	#[case("/data/2020-07-01.extra.txt", "20200701")]
	#[case("/data/20200701", "20200701")]
	#[case("/data/2020-07-01.txt/", "20200701")]
	fn extracts_date_token(#[case] input: &str, #[case] expected: &str) {
		assert_eq!(date_get(input), expected);
	}

	#[rstest]
	#[case("/data/notes.txt", "notes")]
	#[case("/data/.hidden", "")]
	#[case("", "")]
	fn passes_malformed_names_through(#[case] input: &str, #[case] expected: &str) {
		assert_eq!(date_get(input), expected);
	}
}
