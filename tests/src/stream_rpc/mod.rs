mod test_stream_changes;
