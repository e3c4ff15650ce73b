mod test_end_to_end;
